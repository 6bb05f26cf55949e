//! Credential-injecting reverse proxy
//!
//! ```text
//! inbound ──► strip mount ──► Director ──► UpstreamClient ──► upstream
//!                             (headers,      (streaming)
//!                              credential,
//!                              URI)
//! ```

pub mod director;
pub mod forwarder;
pub mod target;

pub use director::Director;
pub use forwarder::{ReqwestUpstream, UpstreamClient};
pub use target::{ProxyTarget, ProxyTargetConfig, TlsTrust, UPSTREAM_CONNECT_TIMEOUT};
