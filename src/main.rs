//! Bridge - authenticating backend for the cluster console

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use zeroize::Zeroizing;

use bridge_api::config::{
    BridgeOptions, K8sAuthMode, ProxyMode, UserAuthMode, DEFAULT_BASE_PATH,
    DEFAULT_CONSOLE_VERSION, DEFAULT_KUBECONFIG_CLUSTER_NAME, DEFAULT_LISTEN,
};
use bridge_api::{start_server, Bridge};
use bridge_common::{init_telemetry, LogFormat, TelemetryConfig};

/// Bridge - logs console users in against an OIDC broker and proxies the
/// Kubernetes API with their credentials
#[derive(Parser, Debug)]
#[command(name = "bridge", version, about, long_about = None)]
struct Cli {
    /// Listen URL: http://host:port or https://host:port
    #[arg(long, env = "BRIDGE_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Public URL of the console, used to build OIDC redirect URLs
    #[arg(long, env = "BRIDGE_BASE_ADDRESS", default_value = "")]
    base_address: String,

    /// Path prefix every endpoint is served under; must start and end with '/'
    #[arg(long, env = "BRIDGE_BASE_PATH", default_value = DEFAULT_BASE_PATH)]
    base_path: String,

    /// User authentication: disabled or oidc
    #[arg(long, env = "BRIDGE_USER_AUTH", default_value_t = UserAuthMode::Disabled)]
    user_auth: UserAuthMode,

    /// OIDC issuer URL
    #[arg(long, env = "BRIDGE_USER_AUTH_OIDC_ISSUER_URL", default_value = "")]
    user_auth_oidc_issuer_url: String,

    /// OIDC client id of the console
    #[arg(long, env = "BRIDGE_USER_AUTH_OIDC_CLIENT_ID", default_value = "")]
    user_auth_oidc_client_id: String,

    /// OIDC client secret of the console
    #[arg(
        long,
        env = "BRIDGE_USER_AUTH_OIDC_CLIENT_SECRET",
        default_value = "",
        hide_env_values = true
    )]
    user_auth_oidc_client_secret: String,

    /// Kubernetes API location: in-cluster or off-cluster
    #[arg(long, env = "BRIDGE_K8S_MODE", default_value_t = ProxyMode::InCluster)]
    k8s_mode: ProxyMode,

    /// API server URL when off-cluster
    #[arg(long, env = "BRIDGE_K8S_MODE_OFF_CLUSTER_ENDPOINT", default_value = "")]
    k8s_mode_off_cluster_endpoint: String,

    /// Skip TLS verification of the off-cluster API server
    #[arg(long, env = "BRIDGE_K8S_MODE_OFF_CLUSTER_SKIP_VERIFY_TLS")]
    k8s_mode_off_cluster_skip_verify_tls: bool,

    /// Credential injected into API server requests:
    /// service-account, bearer-token, oidc or passthrough
    #[arg(long, env = "BRIDGE_K8S_AUTH", default_value_t = K8sAuthMode::ServiceAccount)]
    k8s_auth: K8sAuthMode,

    /// Token used with --k8s-auth=bearer-token
    #[arg(
        long,
        env = "BRIDGE_K8S_AUTH_BEARER_TOKEN",
        default_value = "",
        hide_env_values = true
    )]
    k8s_auth_bearer_token: String,

    /// TLS certificate for an https listener
    #[arg(long, env = "BRIDGE_TLS_CERT_FILE", default_value = "")]
    tls_cert_file: String,

    /// TLS private key for an https listener
    #[arg(long, env = "BRIDGE_TLS_KEY_FILE", default_value = "")]
    tls_key_file: String,

    /// PEM bundle trusted when talking to the identity broker
    #[arg(long, env = "BRIDGE_CA_FILE", default_value = "")]
    ca_file: String,

    /// OIDC client id used by kubectl
    #[arg(long, env = "BRIDGE_KUBECTL_CLIENT_ID", default_value = "")]
    kubectl_client_id: String,

    /// OIDC client secret used by kubectl
    #[arg(
        long,
        env = "BRIDGE_KUBECTL_CLIENT_SECRET",
        default_value = "",
        hide_env_values = true
    )]
    kubectl_client_secret: String,

    /// API server URL written into rendered kubeconfigs
    #[arg(long, env = "BRIDGE_K8S_PUBLIC_ENDPOINT", default_value = "")]
    k8s_public_endpoint: String,

    /// Cluster and context name in rendered kubeconfigs
    #[arg(
        long,
        env = "BRIDGE_KUBECONFIG_CLUSTER_NAME",
        default_value = DEFAULT_KUBECONFIG_CLUSTER_NAME
    )]
    kubeconfig_cluster_name: String,

    /// Seconds between OIDC discovery refreshes
    #[arg(
        long,
        env = "BRIDGE_OIDC_REFRESH_INTERVAL_SECS",
        default_value = "300",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    oidc_refresh_interval_secs: u64,

    /// Console release served at /version
    #[arg(long, env = "BRIDGE_CONSOLE_VERSION", default_value = DEFAULT_CONSOLE_VERSION)]
    console_version: String,

    /// Log filter directives; RUST_LOG takes precedence
    #[arg(long, env = "BRIDGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format: json or pretty
    #[arg(long, env = "BRIDGE_LOG_FORMAT", default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl From<Cli> for BridgeOptions {
    fn from(cli: Cli) -> Self {
        BridgeOptions {
            listen: cli.listen,
            base_address: cli.base_address,
            base_path: cli.base_path,
            user_auth: cli.user_auth,
            user_auth_oidc_issuer_url: cli.user_auth_oidc_issuer_url,
            user_auth_oidc_client_id: cli.user_auth_oidc_client_id,
            user_auth_oidc_client_secret: Zeroizing::new(cli.user_auth_oidc_client_secret),
            k8s_mode: cli.k8s_mode,
            k8s_mode_off_cluster_endpoint: cli.k8s_mode_off_cluster_endpoint,
            k8s_mode_off_cluster_skip_verify_tls: cli.k8s_mode_off_cluster_skip_verify_tls,
            k8s_auth: cli.k8s_auth,
            k8s_auth_bearer_token: Zeroizing::new(cli.k8s_auth_bearer_token),
            tls_cert_file: cli.tls_cert_file,
            tls_key_file: cli.tls_key_file,
            ca_file: cli.ca_file,
            kubectl_client_id: cli.kubectl_client_id,
            kubectl_client_secret: Zeroizing::new(cli.kubectl_client_secret),
            k8s_public_endpoint: cli.k8s_public_endpoint,
            kubeconfig_cluster_name: cli.kubeconfig_cluster_name,
            oidc_refresh_interval: Duration::from_secs(cli.oidc_refresh_interval_secs),
            console_version: cli.console_version,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs.
    // Both the listener and the upstream clients depend on it.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The bridge cannot serve or reach upstreams without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        directive: cli.log_level.clone(),
        format: cli.log_format,
    })?;

    let options = BridgeOptions::from(cli);
    info!(options = ?options, "Starting bridge");

    let config = options
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let bridge = Arc::new(Bridge::build(&config).await?);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let refreshers = bridge.start(shutdown.clone()).await?;
    info!(
        authenticators = refreshers.len(),
        "Identity provider discovery complete"
    );

    let result = start_server(bridge, &config.listen, shutdown.clone()).await;

    shutdown.cancel();
    for refresher in refreshers {
        if let Err(e) = refresher.await {
            error!(error = %e, "Discovery refresh task failed");
        }
    }

    result?;
    info!("Bridge stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
