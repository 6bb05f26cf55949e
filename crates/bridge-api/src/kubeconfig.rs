//! Kubeconfig rendering
//!
//! Renders a single-context kubeconfig whose user authenticates through the
//! `oidc` auth-provider plugin against the same identity broker as the
//! console, using the kubectl client's own credentials.
//!
//! Rendering is pure: the only inputs are the template fields fixed at
//! startup and, optionally, tokens minted by an out-of-band login.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::auth::TokenSet;
use crate::error::Error;

/// Name of the kubectl auth-provider plugin
const OIDC_AUTH_PROVIDER: &str = "oidc";

/// Kubeconfig structure
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<KubeconfigCluster>,
    /// Users
    pub users: Vec<KubeconfigUser>,
    /// Contexts
    pub contexts: Vec<KubeconfigContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// User entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User configuration
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Auth-provider plugin
    pub auth_provider: AuthProviderConfig,
}

/// Auth-provider plugin entry
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthProviderConfig {
    /// Plugin name
    pub name: String,
    /// Plugin settings
    pub config: OidcProviderConfig,
}

/// Settings of the `oidc` auth-provider plugin
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OidcProviderConfig {
    /// Issuer URL
    pub idp_issuer_url: String,
    /// Identity broker CA (base64 encoded); omitted when the broker uses public roots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idp_certificate_authority_data: Option<String>,
    /// Kubectl client id
    pub client_id: String,
    /// Kubectl client secret
    pub client_secret: String,
    /// ID token, empty until a login fills it
    pub id_token: String,
    /// Refresh token, empty until a login fills it
    pub refresh_token: String,
}

impl std::fmt::Debug for OidcProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcProviderConfig")
            .field("idp_issuer_url", &self.idp_issuer_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Context entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

/// Fixed inputs for rendering kubectl configurations
#[derive(Clone)]
pub struct KubeConfigTemplate {
    cluster_name: String,
    api_server_endpoint: String,
    k8s_ca_data: Option<String>,
    broker_ca_data: Option<String>,
    issuer_url: String,
    client_id: String,
    client_secret: Zeroizing<String>,
}

impl KubeConfigTemplate {
    /// Create a template. CA inputs are PEM bytes and are base64-encoded here.
    pub fn new(
        cluster_name: impl Into<String>,
        api_server_endpoint: impl Into<String>,
        k8s_ca_pem: Option<&[u8]>,
        broker_ca_pem: Option<&[u8]>,
        issuer_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            api_server_endpoint: api_server_endpoint.into(),
            k8s_ca_data: k8s_ca_pem.filter(|p| !p.is_empty()).map(|p| STANDARD.encode(p)),
            broker_ca_data: broker_ca_pem
                .filter(|p| !p.is_empty())
                .map(|p| STANDARD.encode(p)),
            issuer_url: issuer_url.into(),
            client_id: client_id.into(),
            client_secret: Zeroizing::new(client_secret.into()),
        }
    }

    /// Get the API server endpoint written into rendered configs
    pub fn api_server_endpoint(&self) -> &str {
        &self.api_server_endpoint
    }

    /// Build the kubeconfig document, with token placeholders left empty
    /// unless `tokens` is given
    pub fn kubeconfig(&self, tokens: Option<&TokenSet>) -> Kubeconfig {
        let user_name = format!("{}-user", self.cluster_name);

        let (id_token, refresh_token) = match tokens {
            Some(t) => (
                t.id_token.to_string(),
                t.refresh_token
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };

        Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![KubeconfigCluster {
                name: self.cluster_name.clone(),
                cluster: ClusterConfig {
                    server: self.api_server_endpoint.clone(),
                    certificate_authority_data: self.k8s_ca_data.clone(),
                },
            }],
            users: vec![KubeconfigUser {
                name: user_name.clone(),
                user: UserConfig {
                    auth_provider: AuthProviderConfig {
                        name: OIDC_AUTH_PROVIDER.to_string(),
                        config: OidcProviderConfig {
                            idp_issuer_url: self.issuer_url.clone(),
                            idp_certificate_authority_data: self.broker_ca_data.clone(),
                            client_id: self.client_id.clone(),
                            client_secret: self.client_secret.to_string(),
                            id_token,
                            refresh_token,
                        },
                    },
                },
            }],
            contexts: vec![KubeconfigContext {
                name: self.cluster_name.clone(),
                context: ContextConfig {
                    cluster: self.cluster_name.clone(),
                    user: user_name,
                },
            }],
            current_context: self.cluster_name.clone(),
        }
    }

    /// Render the kubeconfig as YAML
    pub fn render(&self, tokens: Option<&TokenSet>) -> Result<Zeroizing<String>, Error> {
        serde_yaml::to_string(&self.kubeconfig(tokens))
            .map(Zeroizing::new)
            .map_err(|e| Error::Internal(format!("failed to render kubeconfig: {}", e)))
    }
}

impl std::fmt::Debug for KubeConfigTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeConfigTemplate")
            .field("cluster_name", &self.cluster_name)
            .field("api_server_endpoint", &self.api_server_endpoint)
            .field("issuer_url", &self.issuer_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
