//! Path utilities and fixed endpoint paths
//!
//! All endpoint paths are relative to the configured base path and are
//! composed with [`single_joining_slash`].

mod path;

pub use path::{single_joining_slash, strip_mount_prefix};

/// Starts the OIDC authorization-code flow
pub const AUTH_LOGIN_ENDPOINT: &str = "/auth/login";
/// OIDC redirect target receiving the authorization code
pub const AUTH_CALLBACK_ENDPOINT: &str = "/auth/callback";
/// Browser destination after a successful login
pub const AUTH_SUCCESS_ENDPOINT: &str = "/auth/success";
/// Browser destination after a failed login
pub const AUTH_ERROR_ENDPOINT: &str = "/auth/error";
/// Clears the session cookie
pub const AUTH_LOGOUT_ENDPOINT: &str = "/auth/logout";

/// Mount point for the Kubernetes API server proxy
pub const K8S_PROXY_ENDPOINT: &str = "/api/kubernetes/";
/// Mount point for the identity broker proxy
pub const DEX_PROXY_ENDPOINT: &str = "/api/dex/";

/// Starts the out-of-band login for the kubectl client
pub const KUBECTL_LOGIN_ENDPOINT: &str = "/api/kubectl/login";
/// Renders a kubeconfig, optionally redeeming an out-of-band code
pub const KUBECTL_KUBECONFIG_ENDPOINT: &str = "/api/kubectl/kubeconfig";

/// Reports the deployed console release
pub const VERSION_ENDPOINT: &str = "/version";

/// Liveness check
pub const HEALTH_ENDPOINT: &str = "/health";
/// Readiness check; ready once every authenticator has discovered its provider
pub const READY_ENDPOINT: &str = "/ready";
