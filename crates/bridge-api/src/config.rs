//! Startup configuration
//!
//! [`BridgeOptions`] holds flag values as given. [`BridgeOptions::validate`]
//! checks them without touching the filesystem or network and produces a
//! [`BridgeConfig`] in which every mode axis is a data-carrying enum, so
//! later stages match exhaustively instead of comparing strings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;
use zeroize::Zeroizing;

use crate::auth::RefreshConfig;

/// Default listen URL
pub const DEFAULT_LISTEN: &str = "http://0.0.0.0:9000";

/// Default base path
pub const DEFAULT_BASE_PATH: &str = "/";

/// Default cluster name in rendered kubeconfigs
pub const DEFAULT_KUBECONFIG_CLUSTER_NAME: &str = "kubernetes";

/// Console release reported when none is configured
pub const DEFAULT_CONSOLE_VERSION: &str = "UNKNOWN";

/// Configuration errors. Each startup rejection has its own variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A mode flag has an unknown value
    #[error("invalid value '{value}' for --{flag}, expected one of: {expected}")]
    InvalidMode {
        /// Flag name
        flag: &'static str,
        /// Rejected value
        value: String,
        /// Accepted values
        expected: &'static str,
    },

    /// Base path does not start and end with a slash
    #[error("--base-path must start and end with '/', got '{0}'")]
    InvalidBasePath(String),

    /// A URL flag is malformed or lacks scheme or host
    #[error("--{flag} is not a valid URL: {reason}")]
    InvalidUrl {
        /// Flag name
        flag: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// OIDC user auth without an issuer
    #[error("--user-auth=oidc requires --user-auth-oidc-issuer-url")]
    MissingIssuerUrl,

    /// A flag required by the selected modes is empty
    #[error("--{flag} is required")]
    MissingValue {
        /// Flag name
        flag: &'static str,
    },

    /// Service-account credentials only exist in-cluster
    #[error("--k8s-auth=service-account requires --k8s-mode=in-cluster")]
    ServiceAccountRequiresInCluster,

    /// Session-cookie credentials need a console login
    #[error("--k8s-auth=oidc requires --user-auth=oidc")]
    OidcK8sAuthRequiresOidcUserAuth,

    /// Only one of the kubectl client id and secret was given
    #[error("--kubectl-client-id and --kubectl-client-secret must be given together")]
    IncompleteKubectlCredentials,

    /// Listen URL scheme is neither http nor https
    #[error("--listen scheme must be http or https, got '{0}'")]
    UnsupportedListenScheme(String),

    /// HTTPS listener without certificate or key
    #[error("--listen with https requires --{flag}")]
    MissingTlsMaterial {
        /// Flag name
        flag: &'static str,
    },

    /// TLS certificate or key unreadable or invalid
    #[error("invalid TLS material: {0}")]
    InvalidTlsMaterial(String),

    /// CA file unreadable or without certificates
    #[error("failed to load CA file {path}: {reason}")]
    CaFile {
        /// File path
        path: String,
        /// What went wrong
        reason: String,
    },

    /// In-cluster service account or API server environment missing
    #[error("in-cluster configuration unavailable: {0}")]
    InClusterUnavailable(String),
}

/// Where the Kubernetes API server is
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProxyMode {
    /// Discover the API server from the pod environment
    #[default]
    InCluster,
    /// Use an explicit endpoint
    OffCluster,
}

impl FromStr for ProxyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-cluster" => Ok(Self::InCluster),
            "off-cluster" => Ok(Self::OffCluster),
            _ => Err(ConfigError::InvalidMode {
                flag: "k8s-mode",
                value: s.to_string(),
                expected: "in-cluster, off-cluster",
            }),
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InCluster => write!(f, "in-cluster"),
            Self::OffCluster => write!(f, "off-cluster"),
        }
    }
}

/// How console users authenticate
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UserAuthMode {
    /// No login; every caller is anonymous
    #[default]
    Disabled,
    /// OIDC authorization-code login
    Oidc,
}

impl FromStr for UserAuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "oidc" => Ok(Self::Oidc),
            _ => Err(ConfigError::InvalidMode {
                flag: "user-auth",
                value: s.to_string(),
                expected: "disabled, oidc",
            }),
        }
    }
}

impl fmt::Display for UserAuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Oidc => write!(f, "oidc"),
        }
    }
}

/// Which credential the Kubernetes proxy injects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum K8sAuthMode {
    /// The pod's service-account token
    #[default]
    ServiceAccount,
    /// A fixed token from `--k8s-auth-bearer-token`
    BearerToken,
    /// The console session's ID token
    Oidc,
    /// The caller's own bearer token
    Passthrough,
}

impl FromStr for K8sAuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service-account" => Ok(Self::ServiceAccount),
            "bearer-token" => Ok(Self::BearerToken),
            "oidc" => Ok(Self::Oidc),
            "passthrough" => Ok(Self::Passthrough),
            _ => Err(ConfigError::InvalidMode {
                flag: "k8s-auth",
                value: s.to_string(),
                expected: "service-account, bearer-token, oidc, passthrough",
            }),
        }
    }
}

impl fmt::Display for K8sAuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceAccount => write!(f, "service-account"),
            Self::BearerToken => write!(f, "bearer-token"),
            Self::Oidc => write!(f, "oidc"),
            Self::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Raw option values, one field per flag. Empty strings mean "not given".
#[derive(Clone)]
pub struct BridgeOptions {
    /// `--listen`
    pub listen: String,
    /// `--base-address`
    pub base_address: String,
    /// `--base-path`
    pub base_path: String,
    /// `--user-auth`
    pub user_auth: UserAuthMode,
    /// `--user-auth-oidc-issuer-url`
    pub user_auth_oidc_issuer_url: String,
    /// `--user-auth-oidc-client-id`
    pub user_auth_oidc_client_id: String,
    /// `--user-auth-oidc-client-secret`
    pub user_auth_oidc_client_secret: Zeroizing<String>,
    /// `--k8s-mode`
    pub k8s_mode: ProxyMode,
    /// `--k8s-mode-off-cluster-endpoint`
    pub k8s_mode_off_cluster_endpoint: String,
    /// `--k8s-mode-off-cluster-skip-verify-tls`
    pub k8s_mode_off_cluster_skip_verify_tls: bool,
    /// `--k8s-auth`
    pub k8s_auth: K8sAuthMode,
    /// `--k8s-auth-bearer-token`
    pub k8s_auth_bearer_token: Zeroizing<String>,
    /// `--tls-cert-file`
    pub tls_cert_file: String,
    /// `--tls-key-file`
    pub tls_key_file: String,
    /// `--ca-file`
    pub ca_file: String,
    /// `--kubectl-client-id`
    pub kubectl_client_id: String,
    /// `--kubectl-client-secret`
    pub kubectl_client_secret: Zeroizing<String>,
    /// `--k8s-public-endpoint`
    pub k8s_public_endpoint: String,
    /// `--kubeconfig-cluster-name`
    pub kubeconfig_cluster_name: String,
    /// `--oidc-refresh-interval-secs`
    pub oidc_refresh_interval: Duration,
    /// `--console-version`
    pub console_version: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            base_address: String::new(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            user_auth: UserAuthMode::default(),
            user_auth_oidc_issuer_url: String::new(),
            user_auth_oidc_client_id: String::new(),
            user_auth_oidc_client_secret: Zeroizing::default(),
            k8s_mode: ProxyMode::default(),
            k8s_mode_off_cluster_endpoint: String::new(),
            k8s_mode_off_cluster_skip_verify_tls: false,
            k8s_auth: K8sAuthMode::default(),
            k8s_auth_bearer_token: Zeroizing::default(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            ca_file: String::new(),
            kubectl_client_id: String::new(),
            kubectl_client_secret: Zeroizing::default(),
            k8s_public_endpoint: String::new(),
            kubeconfig_cluster_name: DEFAULT_KUBECONFIG_CLUSTER_NAME.to_string(),
            oidc_refresh_interval: RefreshConfig::default().interval,
            console_version: DEFAULT_CONSOLE_VERSION.to_string(),
        }
    }
}

impl fmt::Debug for BridgeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeOptions")
            .field("listen", &self.listen)
            .field("base_address", &self.base_address)
            .field("base_path", &self.base_path)
            .field("user_auth", &self.user_auth)
            .field("k8s_mode", &self.k8s_mode)
            .field("k8s_auth", &self.k8s_auth)
            .finish_non_exhaustive()
    }
}

/// HTTP listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Listen {
    /// Plain HTTP on `addr` (`host:port`)
    Http {
        /// Bind address
        addr: String,
    },
    /// HTTPS on `addr` with the given PEM files
    Https {
        /// Bind address
        addr: String,
        /// Certificate chain
        cert_file: PathBuf,
        /// Private key
        key_file: PathBuf,
    },
}

impl Listen {
    /// Bind address
    pub fn addr(&self) -> &str {
        match self {
            Listen::Http { addr } | Listen::Https { addr, .. } => addr,
        }
    }
}

/// Location of the Kubernetes API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum K8sEndpoint {
    /// From the pod's service-account mount and environment
    InCluster,
    /// Explicit endpoint
    OffCluster {
        /// API server URL
        endpoint: Url,
        /// Skip certificate verification (development only)
        skip_verify_tls: bool,
    },
}

/// Credential injected into Kubernetes API requests
#[derive(Clone)]
pub enum K8sCredentials {
    /// The pod's service-account token
    ServiceAccount,
    /// A fixed token
    BearerToken(Zeroizing<String>),
    /// The console session cookie
    SessionCookie,
    /// The caller's bearer token
    Passthrough,
}

impl fmt::Debug for K8sCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            K8sCredentials::ServiceAccount => f.write_str("ServiceAccount"),
            K8sCredentials::BearerToken(_) => f.write_str("BearerToken(<redacted>)"),
            K8sCredentials::SessionCookie => f.write_str("SessionCookie"),
            K8sCredentials::Passthrough => f.write_str("Passthrough"),
        }
    }
}

/// Kubectl OAuth2 client
#[derive(Clone)]
pub struct KubectlClient {
    /// Client id
    pub client_id: String,
    /// Client secret
    pub client_secret: Zeroizing<String>,
}

/// Validated OIDC login settings
#[derive(Clone)]
pub struct OidcSettings {
    /// Issuer URL
    pub issuer_url: Url,
    /// Console client id
    pub client_id: String,
    /// Console client secret
    pub client_secret: Zeroizing<String>,
    /// Kubectl client, when kubectl credential issuance is enabled
    pub kubectl: Option<KubectlClient>,
}

impl fmt::Debug for OidcSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcSettings")
            .field("issuer_url", &self.issuer_url.as_str())
            .field("client_id", &self.client_id)
            .field(
                "kubectl_client_id",
                &self.kubectl.as_ref().map(|k| k.client_id.as_str()),
            )
            .finish_non_exhaustive()
    }
}

/// Console user authentication
#[derive(Clone, Debug)]
pub enum UserAuth {
    /// No login
    Disabled,
    /// OIDC login
    Oidc(OidcSettings),
}

/// Validated configuration
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Listener
    pub listen: Listen,
    /// Path every endpoint is mounted under; starts and ends with `/`
    pub base_path: String,
    /// Externally visible base URL including the base path
    pub base_url: Option<Url>,
    /// Kubernetes API server location
    pub k8s_endpoint: K8sEndpoint,
    /// Kubernetes proxy credential
    pub k8s_credentials: K8sCredentials,
    /// Console user authentication
    pub user_auth: UserAuth,
    /// CA bundle trusted for the identity broker
    pub ca_file: Option<PathBuf>,
    /// API server endpoint written into kubeconfigs
    pub k8s_public_endpoint: Option<Url>,
    /// Cluster name written into kubeconfigs
    pub kubeconfig_cluster_name: String,
    /// Provider metadata refresh schedule
    pub refresh: RefreshConfig,
    /// Console release reported on the version endpoint
    pub console_version: String,
}

impl BridgeOptions {
    /// Check the options and build a [`BridgeConfig`]
    pub fn validate(&self) -> Result<BridgeConfig, ConfigError> {
        let base_address = optional_url("base-address", &self.base_address)?;

        if !self.base_path.starts_with('/') || !self.base_path.ends_with('/') {
            return Err(ConfigError::InvalidBasePath(self.base_path.clone()));
        }
        let base_url = base_address.map(|mut url| {
            url.set_path(&self.base_path);
            url
        });

        let kubectl = match (
            self.kubectl_client_id.is_empty(),
            self.kubectl_client_secret.is_empty(),
        ) {
            (true, true) => None,
            (false, false) => Some(KubectlClient {
                client_id: self.kubectl_client_id.clone(),
                client_secret: self.kubectl_client_secret.clone(),
            }),
            _ => return Err(ConfigError::IncompleteKubectlCredentials),
        };

        let k8s_endpoint = match self.k8s_mode {
            ProxyMode::InCluster => K8sEndpoint::InCluster,
            ProxyMode::OffCluster => K8sEndpoint::OffCluster {
                endpoint: required_url(
                    "k8s-mode-off-cluster-endpoint",
                    &self.k8s_mode_off_cluster_endpoint,
                )?,
                skip_verify_tls: self.k8s_mode_off_cluster_skip_verify_tls,
            },
        };

        let user_auth = match self.user_auth {
            UserAuthMode::Disabled => UserAuth::Disabled,
            UserAuthMode::Oidc => {
                if base_url.is_none() {
                    return Err(ConfigError::MissingValue {
                        flag: "base-address",
                    });
                }
                if self.user_auth_oidc_issuer_url.is_empty() {
                    return Err(ConfigError::MissingIssuerUrl);
                }
                let issuer_url =
                    required_url("user-auth-oidc-issuer-url", &self.user_auth_oidc_issuer_url)?;
                let client_id =
                    required_value("user-auth-oidc-client-id", &self.user_auth_oidc_client_id)?;
                required_value(
                    "user-auth-oidc-client-secret",
                    &self.user_auth_oidc_client_secret,
                )?;

                UserAuth::Oidc(OidcSettings {
                    issuer_url,
                    client_id,
                    client_secret: self.user_auth_oidc_client_secret.clone(),
                    kubectl,
                })
            }
        };

        let k8s_credentials = match self.k8s_auth {
            K8sAuthMode::ServiceAccount => {
                if self.k8s_mode != ProxyMode::InCluster {
                    return Err(ConfigError::ServiceAccountRequiresInCluster);
                }
                K8sCredentials::ServiceAccount
            }
            K8sAuthMode::BearerToken => {
                required_value("k8s-auth-bearer-token", &self.k8s_auth_bearer_token)?;
                K8sCredentials::BearerToken(self.k8s_auth_bearer_token.clone())
            }
            K8sAuthMode::Oidc => {
                if self.user_auth != UserAuthMode::Oidc {
                    return Err(ConfigError::OidcK8sAuthRequiresOidcUserAuth);
                }
                K8sCredentials::SessionCookie
            }
            K8sAuthMode::Passthrough => K8sCredentials::Passthrough,
        };

        let listen = self.listen()?;

        let refresh = RefreshConfig {
            interval: self.oidc_refresh_interval,
            ..RefreshConfig::default()
        };

        Ok(BridgeConfig {
            listen,
            base_path: self.base_path.clone(),
            base_url,
            k8s_endpoint,
            k8s_credentials,
            user_auth,
            ca_file: non_empty(&self.ca_file).map(PathBuf::from),
            k8s_public_endpoint: optional_url("k8s-public-endpoint", &self.k8s_public_endpoint)?,
            kubeconfig_cluster_name: non_empty(&self.kubeconfig_cluster_name)
                .unwrap_or(DEFAULT_KUBECONFIG_CLUSTER_NAME)
                .to_string(),
            refresh,
            console_version: non_empty(&self.console_version)
                .unwrap_or(DEFAULT_CONSOLE_VERSION)
                .to_string(),
        })
    }

    fn listen(&self) -> Result<Listen, ConfigError> {
        let url = required_url("listen", &self.listen)?;
        let host = url.host_str().unwrap_or_default();
        let port = url.port_or_known_default().ok_or_else(|| ConfigError::InvalidUrl {
            flag: "listen",
            reason: "missing port".to_string(),
        })?;
        let addr = format!("{}:{}", host, port);

        match url.scheme() {
            "http" => Ok(Listen::Http { addr }),
            "https" => {
                let cert_file = non_empty(&self.tls_cert_file).ok_or(
                    ConfigError::MissingTlsMaterial {
                        flag: "tls-cert-file",
                    },
                )?;
                let key_file = non_empty(&self.tls_key_file).ok_or(
                    ConfigError::MissingTlsMaterial {
                        flag: "tls-key-file",
                    },
                )?;
                Ok(Listen::Https {
                    addr,
                    cert_file: PathBuf::from(cert_file),
                    key_file: PathBuf::from(key_file),
                })
            }
            other => Err(ConfigError::UnsupportedListenScheme(other.to_string())),
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|v| !v.is_empty())
}

fn required_value(flag: &'static str, value: &str) -> Result<String, ConfigError> {
    non_empty(value)
        .map(str::to_string)
        .ok_or(ConfigError::MissingValue { flag })
}

/// Parse a URL flag, requiring scheme and host
fn required_url(flag: &'static str, value: &str) -> Result<Url, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingValue { flag });
    }
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        flag,
        reason: e.to_string(),
    })?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidUrl {
            flag,
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn optional_url(flag: &'static str, value: &str) -> Result<Option<Url>, ConfigError> {
    non_empty(value).map(|v| required_url(flag, v)).transpose()
}
