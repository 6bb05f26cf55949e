//! Bridge
//!
//! The authenticating backend of the cluster console. Logs users in against
//! an OIDC identity broker, proxies console traffic to the Kubernetes API
//! server and to the broker with the right bearer credential injected, and
//! renders kubeconfigs for the kubectl client.
//!
//! # Architecture
//!
//! ```text
//! browser ──► Bridge ──► Director ──► K8s API Server
//!             (cookie)   (bearer)
//!                │
//!                └──────► Authenticator ──► Identity Broker
//!                         (OIDC code flow)
//! ```
//!
//! # Endpoints
//!
//! See [`server`].

#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod wiring;

pub use auth::{Authenticator, AuthenticatorConfig, TokenExtractor, TokenSet};
pub use config::{BridgeConfig, BridgeOptions, ConfigError};
pub use error::{AuthFailure, Error, Result};
pub use kubeconfig::KubeConfigTemplate;
pub use proxy::{Director, ProxyTarget, ProxyTargetConfig, TlsTrust};
pub use server::{router, start_server, AppState};
pub use wiring::Bridge;
