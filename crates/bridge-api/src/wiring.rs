//! Startup wiring
//!
//! Turns a validated [`BridgeConfig`] into live components. This is the only
//! place that reads startup files: the broker CA bundle and the in-cluster
//! service-account mount.
//!
//! ```text
//! BridgeConfig ──► Bridge::build ──► k8s ProxyTarget (+ Director)
//!                                ├─► dex ProxyTarget (+ Director)   [oidc]
//!                                ├─► console Authenticator          [oidc]
//!                                ├─► kubectl Authenticator          [oidc + kubectl]
//!                                └─► KubeConfigTemplate             [oidc + kubectl]
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::auth::{
    console_scopes, kubectl_scopes, Authenticator, AuthenticatorConfig, TokenExtractor,
    OOB_REDIRECT_URL,
};
use crate::config::{BridgeConfig, ConfigError, K8sCredentials, K8sEndpoint, OidcSettings, UserAuth};
use crate::error::Error;
use crate::kubeconfig::KubeConfigTemplate;
use crate::proxy::{ProxyTarget, ProxyTargetConfig, TlsTrust};
use crate::routing::{
    single_joining_slash, AUTH_CALLBACK_ENDPOINT, AUTH_ERROR_ENDPOINT, AUTH_SUCCESS_ENDPOINT,
};

/// Directory of the pod's service-account mount
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Timeout for requests to the identity broker
pub const BROKER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Path of the identity broker's API relative to the issuer
const BROKER_API_PATH: &str = "/api";

/// Everything the in-cluster API server proxy needs from the pod
pub struct InClusterConfig {
    /// API server endpoint
    pub endpoint: Url,
    /// Service-account token
    pub token: Zeroizing<String>,
    /// API server CA bundle (PEM)
    pub ca_pem: Vec<u8>,
}

impl InClusterConfig {
    /// Load from the standard service-account mount and pod environment
    pub async fn load() -> Result<Self, ConfigError> {
        Self::load_from(
            std::env::var("KUBERNETES_SERVICE_HOST").ok(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok(),
            Path::new(SERVICE_ACCOUNT_DIR),
        )
        .await
    }

    /// Load from explicit environment values and mount directory
    pub async fn load_from(
        host: Option<String>,
        port: Option<String>,
        dir: &Path,
    ) -> Result<Self, ConfigError> {
        let (host, port) = match (host, port) {
            (Some(h), Some(p)) if !h.is_empty() && !p.is_empty() => (h, p),
            _ => {
                return Err(ConfigError::InClusterUnavailable(
                    "KUBERNETES_SERVICE_HOST and KUBERNETES_SERVICE_PORT must be set".into(),
                ))
            }
        };

        // IPv6 service hosts need brackets in a URL
        let authority = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let endpoint = Url::parse(&format!("https://{}", authority)).map_err(|e| {
            ConfigError::InClusterUnavailable(format!("invalid API server address: {}", e))
        })?;

        let token = tokio::fs::read_to_string(dir.join("token"))
            .await
            .map_err(|e| {
                ConfigError::InClusterUnavailable(format!(
                    "failed to read service account token: {}",
                    e
                ))
            })?;
        let ca_pem = tokio::fs::read(dir.join("ca.crt")).await.map_err(|e| {
            ConfigError::InClusterUnavailable(format!("failed to read service account CA: {}", e))
        })?;

        Ok(Self {
            endpoint,
            token: Zeroizing::new(token.trim().to_string()),
            ca_pem,
        })
    }
}

/// Wired components, ready to serve
pub struct Bridge {
    /// Base path every endpoint is mounted under
    pub base_path: String,
    /// Whether session cookies get the `Secure` attribute
    pub secure_cookies: bool,
    /// Kubernetes API server proxy
    pub k8s_proxy: ProxyTarget,
    /// Identity broker proxy, with OIDC user auth
    pub dex_proxy: Option<ProxyTarget>,
    /// Console login, with OIDC user auth
    pub authenticator: Option<Arc<Authenticator>>,
    /// Kubectl out-of-band login, when a kubectl client is configured
    pub kubectl_authenticator: Option<Arc<Authenticator>>,
    /// Kubeconfig template, when a kubectl client is configured
    pub kubeconfig: Option<KubeConfigTemplate>,
    /// Console release reported on the version endpoint
    pub console_version: String,
}

impl Bridge {
    /// Build every component named by `config`, reading startup files
    pub async fn build(config: &BridgeConfig) -> Result<Self, Error> {
        let broker_ca = match &config.ca_file {
            Some(path) => Some(load_ca_file(path).await?),
            None => None,
        };
        let broker_trust = broker_ca
            .clone()
            .map(TlsTrust::RootCertificates)
            .unwrap_or(TlsTrust::DefaultRoots);

        let in_cluster = match config.k8s_endpoint {
            K8sEndpoint::InCluster => Some(InClusterConfig::load().await?),
            K8sEndpoint::OffCluster { .. } => None,
        };

        Self::assemble(config, broker_ca, broker_trust, in_cluster)
    }

    /// Build from already-loaded startup material
    pub fn assemble(
        config: &BridgeConfig,
        broker_ca: Option<Vec<u8>>,
        broker_trust: TlsTrust,
        in_cluster: Option<InClusterConfig>,
    ) -> Result<Self, Error> {
        let (k8s_target, k8s_ca) = match (&config.k8s_endpoint, &in_cluster) {
            (K8sEndpoint::InCluster, Some(ic)) => (
                ProxyTargetConfig::new(
                    ic.endpoint.clone(),
                    TlsTrust::RootCertificates(ic.ca_pem.clone()),
                ),
                Some(ic.ca_pem.clone()),
            ),
            (K8sEndpoint::InCluster, None) => {
                return Err(ConfigError::InClusterUnavailable(
                    "in-cluster mode without service account material".into(),
                )
                .into())
            }
            (
                K8sEndpoint::OffCluster {
                    endpoint,
                    skip_verify_tls,
                },
                _,
            ) => {
                let trust = if *skip_verify_tls {
                    TlsTrust::InsecureSkipVerify
                } else {
                    TlsTrust::DefaultRoots
                };
                (ProxyTargetConfig::new(endpoint.clone(), trust), None)
            }
        };

        let k8s_extractor = match &config.k8s_credentials {
            K8sCredentials::ServiceAccount => match &in_cluster {
                Some(ic) => TokenExtractor::Constant(ic.token.clone()),
                None => return Err(ConfigError::ServiceAccountRequiresInCluster.into()),
            },
            K8sCredentials::BearerToken(token) => TokenExtractor::Constant(token.clone()),
            K8sCredentials::SessionCookie => TokenExtractor::session_cookie(),
            K8sCredentials::Passthrough => TokenExtractor::Passthrough,
        };

        let k8s_proxy = k8s_target.attach(k8s_extractor)?;
        info!(
            endpoint = %k8s_proxy.endpoint(),
            credentials = ?config.k8s_credentials,
            "Configured Kubernetes API proxy"
        );

        let secure_cookies = config
            .base_url
            .as_ref()
            .is_some_and(|u| u.scheme() == "https");

        let mut bridge = Bridge {
            base_path: config.base_path.clone(),
            secure_cookies,
            k8s_proxy,
            dex_proxy: None,
            authenticator: None,
            kubectl_authenticator: None,
            kubeconfig: None,
            console_version: config.console_version.clone(),
        };

        match &config.user_auth {
            UserAuth::Disabled => {
                warn!("Running with user authentication DISABLED");
            }
            UserAuth::Oidc(settings) => {
                bridge.wire_oidc(config, settings, broker_ca, broker_trust, k8s_ca)?;
            }
        }

        Ok(bridge)
    }

    fn wire_oidc(
        &mut self,
        config: &BridgeConfig,
        settings: &OidcSettings,
        broker_ca: Option<Vec<u8>>,
        broker_trust: TlsTrust,
        k8s_ca: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let base_url = config
            .base_url
            .as_ref()
            .ok_or(ConfigError::MissingValue {
                flag: "base-address",
            })?
            .as_str();

        let http_client = broker_trust
            .client_builder()?
            .timeout(BROKER_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build broker client: {}", e)))?;

        let success_url = single_joining_slash(base_url, AUTH_SUCCESS_ENDPOINT);
        let error_url = single_joining_slash(base_url, AUTH_ERROR_ENDPOINT);

        let kubectl_id = settings.kubectl.as_ref().map(|k| k.client_id.as_str());
        let mut console = AuthenticatorConfig::new(
            "console",
            settings.issuer_url.clone(),
            settings.client_id.clone(),
            settings.client_secret.as_str(),
            single_joining_slash(base_url, AUTH_CALLBACK_ENDPOINT),
            console_scopes(&settings.client_id, kubectl_id),
            success_url.clone(),
            error_url.clone(),
            http_client.clone(),
        );
        console.refresh = config.refresh.clone();
        self.authenticator = Some(Arc::new(Authenticator::new(console)));

        let mut dex_endpoint = settings.issuer_url.clone();
        dex_endpoint.set_path(&single_joining_slash(dex_endpoint.path(), BROKER_API_PATH));
        let dex_proxy = ProxyTargetConfig::new(dex_endpoint, broker_trust)
            .attach(TokenExtractor::session_cookie())?;
        info!(endpoint = %dex_proxy.endpoint(), "Configured identity broker proxy");
        self.dex_proxy = Some(dex_proxy);

        if let Some(kubectl) = &settings.kubectl {
            let mut kubectl_config = AuthenticatorConfig::new(
                "kubectl",
                settings.issuer_url.clone(),
                kubectl.client_id.clone(),
                kubectl.client_secret.as_str(),
                OOB_REDIRECT_URL,
                kubectl_scopes(),
                success_url,
                error_url,
                http_client,
            );
            kubectl_config.refresh = config.refresh.clone();
            self.kubectl_authenticator = Some(Arc::new(Authenticator::new(kubectl_config)));

            let api_server_endpoint = config
                .k8s_public_endpoint
                .as_ref()
                .unwrap_or(self.k8s_proxy.endpoint())
                .to_string();

            self.kubeconfig = Some(KubeConfigTemplate::new(
                config.kubeconfig_cluster_name.clone(),
                api_server_endpoint,
                k8s_ca.as_deref(),
                broker_ca.as_deref(),
                settings.issuer_url.as_str(),
                kubectl.client_id.clone(),
                kubectl.client_secret.as_str(),
            ));
            info!(client_id = %kubectl.client_id, "Kubectl credential issuance enabled");
        }

        Ok(())
    }

    /// Every configured authenticator
    pub fn authenticators(&self) -> impl Iterator<Item = &Arc<Authenticator>> {
        self.authenticator
            .iter()
            .chain(self.kubectl_authenticator.iter())
    }

    /// Run initial discovery for every authenticator and spawn refresh loops.
    ///
    /// Fails if any issuer cannot be discovered.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>, Error> {
        let mut handles = Vec::new();
        for authenticator in self.authenticators() {
            handles.push(authenticator.start(shutdown.clone()).await?);
        }
        Ok(handles)
    }
}

/// Read a CA bundle and check it holds at least one certificate
async fn load_ca_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let ca_error = |reason: String| ConfigError::CaFile {
        path: path.display().to_string(),
        reason,
    };

    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| ca_error(e.to_string()))?;

    TlsTrust::RootCertificates(pem.clone())
        .client_builder()
        .map_err(|e| ca_error(e.to_string()))?;

    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeOptions, K8sAuthMode, ProxyMode, UserAuthMode};

    fn off_cluster_options() -> BridgeOptions {
        BridgeOptions {
            k8s_mode: ProxyMode::OffCluster,
            k8s_mode_off_cluster_endpoint: "https://api.example:6443".into(),
            k8s_auth: K8sAuthMode::BearerToken,
            k8s_auth_bearer_token: Zeroizing::new("static".into()),
            ..BridgeOptions::default()
        }
    }

    fn oidc_options(kubectl: bool) -> BridgeOptions {
        let mut options = BridgeOptions {
            base_address: "https://bridge.example/".into(),
            user_auth: UserAuthMode::Oidc,
            user_auth_oidc_issuer_url: "https://idp.example/".into(),
            user_auth_oidc_client_id: "console".into(),
            user_auth_oidc_client_secret: Zeroizing::new("secret".into()),
            k8s_auth: K8sAuthMode::Oidc,
            ..off_cluster_options()
        };
        if kubectl {
            options.kubectl_client_id = "kubectl".into();
            options.kubectl_client_secret = Zeroizing::new("kubectl-secret".into());
        }
        options
    }

    fn assemble(options: BridgeOptions) -> Bridge {
        let config = options.validate().unwrap();
        Bridge::assemble(&config, None, TlsTrust::DefaultRoots, None).unwrap()
    }

    #[test]
    fn test_user_auth_disabled() {
        let bridge = assemble(off_cluster_options());
        assert!(bridge.authenticator.is_none());
        assert!(bridge.dex_proxy.is_none());
        assert!(bridge.kubeconfig.is_none());
        assert_eq!(bridge.authenticators().count(), 0);
        assert_eq!(bridge.k8s_proxy.endpoint().as_str(), "https://api.example:6443/");
        assert!(matches!(
            bridge.k8s_proxy.director().extractor(),
            TokenExtractor::Constant(_)
        ));
    }

    #[test]
    fn test_oidc_wiring() {
        let bridge = assemble(oidc_options(false));
        let auth = bridge.authenticator.as_ref().unwrap();
        let config = auth.config();
        assert_eq!(config.redirect_url, "https://bridge.example/auth/callback");
        assert_eq!(config.success_url, "https://bridge.example/auth/success");
        assert_eq!(config.error_url, "https://bridge.example/auth/error");
        assert!(!config.scopes.iter().any(|s| s.starts_with("audience:")));

        let dex = bridge.dex_proxy.as_ref().unwrap();
        assert_eq!(dex.endpoint().as_str(), "https://idp.example/api");
        assert!(matches!(
            dex.director().extractor(),
            TokenExtractor::Cookie { .. }
        ));
        assert!(matches!(
            bridge.k8s_proxy.director().extractor(),
            TokenExtractor::Cookie { .. }
        ));
        assert!(bridge.kubectl_authenticator.is_none());
        assert!(bridge.secure_cookies);
    }

    #[test]
    fn test_kubectl_wiring() {
        let bridge = assemble(oidc_options(true));

        let console = bridge.authenticator.as_ref().unwrap().config();
        assert!(console
            .scopes
            .contains(&"audience:server:client_id:console".to_string()));
        assert!(console
            .scopes
            .contains(&"audience:server:client_id:kubectl".to_string()));

        let kubectl = bridge.kubectl_authenticator.as_ref().unwrap().config();
        assert_eq!(kubectl.redirect_url, OOB_REDIRECT_URL);
        assert_eq!(kubectl.client_id, "kubectl");
        assert!(kubectl.scopes.contains(&"offline_access".to_string()));

        let template = bridge.kubeconfig.as_ref().unwrap();
        assert_eq!(template.api_server_endpoint(), "https://api.example:6443/");
        assert_eq!(bridge.authenticators().count(), 2);
    }

    #[test]
    fn test_public_endpoint_overrides_rendered_server() {
        let mut options = oidc_options(true);
        options.k8s_public_endpoint = "https://k8s.public.example".into();
        let bridge = assemble(options);
        assert_eq!(
            bridge.kubeconfig.unwrap().api_server_endpoint(),
            "https://k8s.public.example/"
        );
    }

    #[test]
    fn test_in_cluster_requires_service_account_material() {
        let config = BridgeOptions::default().validate().unwrap();
        let err = Bridge::assemble(&config, None, TlsTrust::DefaultRoots, None)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Config(ConfigError::InClusterUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_in_cluster_load_requires_environment() {
        let err = InClusterConfig::load_from(None, Some("443".into()), Path::new("/nonexistent"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InClusterUnavailable(_)));
    }

    #[tokio::test]
    async fn test_in_cluster_load_from_mount() {
        let dir = std::env::temp_dir().join(format!("bridge-sa-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("token"), "sa-token\n").await.unwrap();
        tokio::fs::write(dir.join("ca.crt"), "ca").await.unwrap();

        let config = InClusterConfig::load_from(Some("10.96.0.1".into()), Some("443".into()), &dir)
            .await
            .unwrap();
        assert_eq!(config.endpoint.as_str(), "https://10.96.0.1/");
        assert_eq!(config.token.as_str(), "sa-token");
        assert_eq!(config.ca_pem, b"ca");

        let v6 = InClusterConfig::load_from(Some("fd00::1".into()), Some("6443".into()), &dir)
            .await
            .unwrap();
        assert_eq!(v6.endpoint.as_str(), "https://[fd00::1]:6443/");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_ca_file_without_certificates_rejected() {
        let path = std::env::temp_dir().join(format!("bridge-ca-{}.pem", std::process::id()));
        tokio::fs::write(&path, "not a certificate").await.unwrap();

        let err = load_ca_file(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::CaFile { .. }));

        tokio::fs::remove_file(&path).await.unwrap();

        let err = load_ca_file(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::CaFile { .. }));
    }
}
