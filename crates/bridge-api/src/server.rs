//! Bridge HTTP server
//!
//! # Endpoints
//!
//! All paths are relative to the configured base path.
//!
//! - `GET auth/login?next=` - Start the console OIDC login
//! - `GET auth/callback` - OIDC redirect target; sets the session cookie
//! - `GET auth/success`, `GET auth/error` - Login outcome landing points
//! - `GET|POST auth/logout` - Clear the session cookie
//! - `GET api/kubectl/login` - Start the kubectl out-of-band login
//! - `GET|POST api/kubectl/kubeconfig` - Render a kubeconfig
//! - `* api/kubernetes/*` - Proxy to the Kubernetes API server
//! - `* api/dex/*` - Proxy to the identity broker
//! - `GET version` - Console release this bridge was deployed with
//! - `GET health`, `GET ready` - Liveness and readiness

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Form, Query, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use cookie::{time, Cookie, SameSite};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{oidc::sanitize_return_to, Authenticator, CallbackParams, SESSION_COOKIE_NAME};
use crate::config::{ConfigError, Listen};
use crate::error::{AuthFailure, Error};
use crate::proxy::ProxyTarget;
use crate::routing::{
    single_joining_slash, strip_mount_prefix, AUTH_CALLBACK_ENDPOINT, AUTH_ERROR_ENDPOINT,
    AUTH_LOGIN_ENDPOINT, AUTH_LOGOUT_ENDPOINT, AUTH_SUCCESS_ENDPOINT, DEX_PROXY_ENDPOINT,
    HEALTH_ENDPOINT, K8S_PROXY_ENDPOINT, KUBECTL_KUBECONFIG_ENDPOINT, KUBECTL_LOGIN_ENDPOINT,
    READY_ENDPOINT, VERSION_ENDPOINT,
};
use crate::wiring::Bridge;

/// Time allowed for in-flight requests after shutdown is requested
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Wired components
    pub bridge: Arc<Bridge>,
}

impl AppState {
    fn authenticator(&self) -> Result<&Arc<Authenticator>, Error> {
        self.bridge
            .authenticator
            .as_ref()
            .ok_or_else(|| Error::Internal("user authentication is disabled".into()))
    }

    fn kubectl_authenticator(&self) -> Result<&Arc<Authenticator>, Error> {
        self.bridge
            .kubectl_authenticator
            .as_ref()
            .ok_or_else(|| Error::Internal("kubectl login is not configured".into()))
    }

    fn base_path(&self) -> &str {
        &self.bridge.base_path
    }
}

/// Build the router for `bridge`
pub fn router(bridge: Arc<Bridge>) -> Router {
    let base = bridge.base_path.clone();
    let path = |endpoint: &str| single_joining_slash(&base, endpoint);

    let mut app = Router::new()
        .route(&path(HEALTH_ENDPOINT), get(|| async { "ok" }))
        .route(&path(READY_ENDPOINT), get(ready_handler))
        .route(&path(VERSION_ENDPOINT), get(version_handler));

    if bridge.authenticator.is_some() {
        app = app
            .route(&path(AUTH_LOGIN_ENDPOINT), get(login_handler))
            .route(&path(AUTH_CALLBACK_ENDPOINT), get(callback_handler))
            .route(&path(AUTH_SUCCESS_ENDPOINT), get(success_handler))
            .route(&path(AUTH_ERROR_ENDPOINT), get(error_handler))
            .route(
                &path(AUTH_LOGOUT_ENDPOINT),
                get(logout_handler).post(logout_handler),
            );
    }

    if bridge.kubectl_authenticator.is_some() && bridge.kubeconfig.is_some() {
        app = app
            .route(&path(KUBECTL_LOGIN_ENDPOINT), get(kubectl_login_handler))
            .route(
                &path(KUBECTL_KUBECONFIG_ENDPOINT),
                get(kubeconfig_template_handler).post(kubeconfig_exchange_handler),
            );
    }

    app = mount_proxy(app, &path(K8S_PROXY_ENDPOINT), bridge.k8s_proxy.clone());
    if let Some(dex) = &bridge.dex_proxy {
        app = mount_proxy(app, &path(DEX_PROXY_ENDPOINT), dex.clone());
    }

    app.with_state(AppState { bridge })
}

/// Route every method under `mount` to `target`
fn mount_proxy(app: Router<AppState>, mount: &str, target: ProxyTarget) -> Router<AppState> {
    let bare = mount.trim_end_matches('/').to_string();
    let handler = {
        let mount = bare.clone();
        move |request: Request| async move { proxy_request(&target, &mount, request).await }
    };

    app.route(&bare, any(handler.clone()))
        .route(&format!("{}/", bare), any(handler.clone()))
        .route(&format!("{}/{{*path}}", bare), any(handler))
}

/// Make the request mount-relative and forward it
async fn proxy_request(target: &ProxyTarget, mount: &str, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();

    let relative = match strip_mount_prefix(parts.uri.path(), mount) {
        Some(relative) => relative,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{}?{}", relative, query),
        None => relative.to_string(),
    };

    parts.uri = match Uri::builder().path_and_query(path_and_query).build() {
        Ok(uri) => uri,
        Err(e) => return Error::Internal(format!("invalid request URI: {}", e)).into_response(),
    };

    match target.forward(axum::http::Request::from_parts(parts, body)).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Handle GET ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.bridge.authenticators().all(|a| a.is_ready()) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Handle GET version
async fn version_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "version": state.bridge.console_version }))
}

/// Query parameters for the login endpoint
#[derive(Debug, Deserialize, Default)]
pub struct LoginParams {
    /// Same-origin path to land on after login
    pub next: Option<String>,
}

/// Handle GET auth/login
async fn login_handler(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> Result<Response, Error> {
    let authenticator = state.authenticator()?;
    match authenticator.login(params.next.as_deref()).await {
        Ok(url) => Ok(Redirect::to(&url).into_response()),
        Err(Error::Unauthorized(failure)) => {
            Ok(Redirect::to(&authenticator.error_redirect(failure)).into_response())
        }
        Err(e) => Err(e),
    }
}

/// Handle GET auth/callback
async fn callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, Error> {
    let authenticator = state.authenticator()?;

    let success = match authenticator.callback(params).await {
        Ok(success) => success,
        Err(failure) => {
            warn!(reason = failure.code(), "Login failed");
            return Ok(Redirect::to(&authenticator.error_redirect(failure)).into_response());
        }
    };

    let max_age = success.token.remaining_lifetime().as_secs();
    let cookie = Cookie::build((SESSION_COOKIE_NAME, success.token.id_token.to_string()))
        .path(state.base_path().to_string())
        .http_only(true)
        .secure(state.bridge.secure_cookies)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age as i64))
        .build();

    redirect_with_cookie(&success.redirect, cookie)
}

/// Query parameters for the success endpoint
#[derive(Debug, Deserialize, Default)]
pub struct SuccessParams {
    /// Path recorded at login
    pub next: Option<String>,
}

/// Handle GET auth/success
async fn success_handler(
    State(state): State<AppState>,
    Query(params): Query<SuccessParams>,
) -> Redirect {
    let target = params
        .next
        .as_deref()
        .and_then(sanitize_return_to)
        .unwrap_or_else(|| state.base_path().to_string());
    Redirect::to(&target)
}

/// Query parameters for the error endpoint
#[derive(Debug, Deserialize, Default)]
pub struct ErrorParams {
    /// Reason code
    pub error: Option<String>,
}

/// Handle GET auth/error
async fn error_handler(Query(params): Query<ErrorParams>) -> Response {
    match params.error.as_deref().and_then(AuthFailure::from_code) {
        Some(failure) => Error::Unauthorized(failure).into_response(),
        None => (StatusCode::BAD_REQUEST, "unknown login error").into_response(),
    }
}

/// Handle auth/logout
async fn logout_handler(State(state): State<AppState>) -> Result<Response, Error> {
    let cookie = Cookie::build((SESSION_COOKIE_NAME, ""))
        .path(state.base_path().to_string())
        .http_only(true)
        .secure(state.bridge.secure_cookies)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::ZERO)
        .build();

    redirect_with_cookie(state.base_path(), cookie)
}

fn redirect_with_cookie(to: &str, cookie: Cookie<'_>) -> Result<Response, Error> {
    let mut value = HeaderValue::from_str(&cookie.to_string())
        .map_err(|e| Error::Internal(format!("invalid session cookie: {}", e)))?;
    value.set_sensitive(true);

    let mut response = Redirect::to(to).into_response();
    response.headers_mut().append(header::SET_COOKIE, value);
    Ok(response)
}

/// Handle GET api/kubectl/login
async fn kubectl_login_handler(State(state): State<AppState>) -> Result<Redirect, Error> {
    let url = state.kubectl_authenticator()?.out_of_band_url().await?;
    Ok(Redirect::to(&url))
}

/// Form body for the kubeconfig exchange
#[derive(Deserialize)]
pub struct KubeconfigForm {
    /// Out-of-band authorization code
    pub code: String,
}

/// Handle GET api/kubectl/kubeconfig
async fn kubeconfig_template_handler(State(state): State<AppState>) -> Result<Response, Error> {
    kubeconfig_response(&state, None)
}

/// Handle POST api/kubectl/kubeconfig
async fn kubeconfig_exchange_handler(
    State(state): State<AppState>,
    Form(form): Form<KubeconfigForm>,
) -> Result<Response, Error> {
    let token = state
        .kubectl_authenticator()?
        .exchange_code(&form.code)
        .await?;

    debug!(subject = %token.subject, "Issuing kubeconfig");
    kubeconfig_response(&state, Some(&token))
}

fn kubeconfig_response(
    state: &AppState,
    token: Option<&crate::auth::TokenSet>,
) -> Result<Response, Error> {
    let template = state
        .bridge
        .kubeconfig
        .as_ref()
        .ok_or_else(|| Error::Internal("kubeconfig rendering is not configured".into()))?;
    let yaml = template.render(token)?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/yaml"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        Body::from(yaml.to_string()),
    )
        .into_response())
}

/// Serve `bridge` on `listen` until `shutdown` is cancelled
pub async fn start_server(
    bridge: Arc<Bridge>,
    listen: &Listen,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let app = router(bridge);
    let addr = resolve(listen.addr()).await?;

    match listen {
        Listen::Http { .. } => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| Error::Internal(format!("failed to bind {}: {}", addr, e)))?;

            info!(addr = %addr, "Starting bridge server (no TLS)");

            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(|e| Error::Internal(format!("Server error: {}", e)))
        }
        Listen::Https {
            cert_file,
            key_file,
            ..
        } => {
            let tls_config = RustlsConfig::from_pem_file(cert_file, key_file)
                .await
                .map_err(|e| ConfigError::InvalidTlsMaterial(e.to_string()))?;

            let handle = axum_server::Handle::new();
            tokio::spawn({
                let handle = handle.clone();
                async move {
                    shutdown.cancelled().await;
                    handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
                }
            });

            info!(addr = %addr, "Starting bridge server (TLS)");

            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::Internal(format!("Server error: {}", e)))
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, Error> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| Error::Internal(format!("no address for {}", addr)))
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
