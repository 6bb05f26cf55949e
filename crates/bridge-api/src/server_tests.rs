use super::*;

use axum::http::Method;
use tower::ServiceExt;
use url::Url;
use zeroize::Zeroizing;

use crate::auth::TokenExtractor;
use crate::config::{BridgeOptions, K8sAuthMode, ProxyMode, UserAuthMode};
use crate::proxy::forwarder::MockUpstreamClient;
use crate::proxy::{ProxyTargetConfig, TlsTrust};

fn options(user_auth: UserAuthMode, kubectl: bool) -> BridgeOptions {
    let mut options = BridgeOptions {
        base_address: "https://bridge.example/".into(),
        k8s_mode: ProxyMode::OffCluster,
        k8s_mode_off_cluster_endpoint: "https://api.example:6443".into(),
        k8s_auth: K8sAuthMode::BearerToken,
        k8s_auth_bearer_token: Zeroizing::new("sa-token".into()),
        ..BridgeOptions::default()
    };
    if user_auth == UserAuthMode::Oidc {
        options.user_auth = UserAuthMode::Oidc;
        options.user_auth_oidc_issuer_url = "https://idp.example/".into();
        options.user_auth_oidc_client_id = "console".into();
        options.user_auth_oidc_client_secret = Zeroizing::new("secret".into());
    }
    if kubectl {
        options.kubectl_client_id = "kubectl".into();
        options.kubectl_client_secret = Zeroizing::new("kubectl-secret".into());
    }
    options
}

fn bridge(user_auth: UserAuthMode, kubectl: bool) -> Bridge {
    let config = options(user_auth, kubectl).validate().unwrap();
    Bridge::assemble(&config, None, TlsTrust::DefaultRoots, None).unwrap()
}

fn with_upstream(mut bridge: Bridge, upstream: MockUpstreamClient) -> Bridge {
    bridge.k8s_proxy = ProxyTargetConfig::new(
        Url::parse("https://api.example:6443").unwrap(),
        TlsTrust::DefaultRoots,
    )
    .attach_with_client(TokenExtractor::constant("sa-token"), Arc::new(upstream));
    bridge
}

async fn send(bridge: Bridge, request: axum::http::Request<Body>) -> Response {
    router(Arc::new(bridge)).oneshot(request).await.unwrap()
}

fn get(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn location(response: &Response) -> &str {
    response.headers()[header::LOCATION].to_str().unwrap()
}

fn set_cookie(response: &Response) -> String {
    response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .to_string()
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ========================================================================
// Health, readiness and version
// ========================================================================

#[tokio::test]
async fn test_health() {
    let response = send(bridge(UserAuthMode::Disabled, false), get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "ok");
}

#[tokio::test]
async fn test_ready_without_authenticators() {
    let response = send(bridge(UserAuthMode::Disabled, false), get("/ready")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_not_ready_before_discovery() {
    let response = send(bridge(UserAuthMode::Oidc, false), get("/ready")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_version_reports_console_release() {
    let mut options = options(UserAuthMode::Disabled, false);
    options.console_version = "1.9.4".into();
    let bridge = Bridge::assemble(&options.validate().unwrap(), None, TlsTrust::DefaultRoots, None)
        .unwrap();

    let response = send(bridge, get("/version")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["version"], "1.9.4");
}

#[tokio::test]
async fn test_version_defaults_to_unknown() {
    let response = send(bridge(UserAuthMode::Disabled, false), get("/version")).await;
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["version"], "UNKNOWN");
}

// ========================================================================
// Auth endpoints
// ========================================================================

#[tokio::test]
async fn test_auth_routes_absent_when_disabled() {
    let response = send(bridge(UserAuthMode::Disabled, false), get("/auth/login")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_login_before_discovery_redirects_to_error() {
    let response = send(bridge(UserAuthMode::Oidc, false), get("/auth/login")).await;
    assert!(response.status().is_redirection());
    assert_eq!(
        location(&response),
        "https://bridge.example/auth/error?error=provider_unavailable"
    );
}

#[tokio::test]
async fn test_callback_without_state_redirects_to_error() {
    let response = send(
        bridge(UserAuthMode::Oidc, false),
        get("/auth/callback?code=abc"),
    )
    .await;
    assert!(response.status().is_redirection());
    assert_eq!(
        location(&response),
        "https://bridge.example/auth/error?error=missing_state"
    );
    assert!(response.headers().get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn test_callback_unknown_state_redirects_to_error() {
    let response = send(
        bridge(UserAuthMode::Oidc, false),
        get("/auth/callback?code=abc&state=forged"),
    )
    .await;
    assert_eq!(
        location(&response),
        "https://bridge.example/auth/error?error=invalid_state"
    );
}

#[tokio::test]
async fn test_success_redirects_to_sanitized_next() {
    let response = send(
        bridge(UserAuthMode::Oidc, false),
        get("/auth/success?next=/k8s/pods"),
    )
    .await;
    assert_eq!(location(&response), "/k8s/pods");

    let response = send(
        bridge(UserAuthMode::Oidc, false),
        get("/auth/success?next=//evil.example/"),
    )
    .await;
    assert_eq!(location(&response), "/");
}

#[tokio::test]
async fn test_error_endpoint_reports_reason() {
    let response = send(
        bridge(UserAuthMode::Oidc, false),
        get("/auth/error?error=invalid_token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["kind"], "Status");
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn test_error_endpoint_unknown_reason() {
    let response = send(
        bridge(UserAuthMode::Oidc, false),
        get("/auth/error?error=bogus"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_logout_clears_cookie() {
    for method in [Method::GET, Method::POST] {
        let request = axum::http::Request::builder()
            .method(method)
            .uri("/auth/logout")
            .body(Body::empty())
            .unwrap();
        let response = send(bridge(UserAuthMode::Oidc, false), request).await;

        assert!(response.status().is_redirection());
        assert_eq!(location(&response), "/");
        let cookie = set_cookie(&response);
        assert!(cookie.starts_with(&format!("{}=;", SESSION_COOKIE_NAME)));
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
    }
}

// ========================================================================
// Kubectl endpoints
// ========================================================================

#[tokio::test]
async fn test_kubectl_routes_absent_without_kubectl_client() {
    let response = send(
        bridge(UserAuthMode::Oidc, false),
        get("/api/kubectl/kubeconfig"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_kubeconfig_template() {
    let response = send(
        bridge(UserAuthMode::Oidc, true),
        get("/api/kubectl/kubeconfig"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/yaml"
    );

    let doc: serde_yaml::Value = serde_yaml::from_str(&body_string(response).await).unwrap();
    let config = &doc["users"][0]["user"]["auth-provider"]["config"];
    assert_eq!(config["client-id"], "kubectl");
    assert_eq!(config["id-token"], "");
}

#[tokio::test]
async fn test_kubeconfig_exchange_before_discovery_unauthorized() {
    let request = axum::http::Request::builder()
        .method(Method::POST)
        .uri("/api/kubectl/kubeconfig")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("code=abc"))
        .unwrap();
    let response = send(bridge(UserAuthMode::Oidc, true), request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ========================================================================
// Proxy mounts
// ========================================================================

#[tokio::test]
async fn test_k8s_proxy_strips_mount() {
    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().times(1).returning(|req| {
        assert_eq!(
            req.uri().to_string(),
            "https://api.example:6443/api/v1/namespaces?limit=10"
        );
        assert_eq!(req.headers()[header::AUTHORIZATION], "Bearer sa-token");
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("namespaces"))
            .unwrap())
    });

    let bridge = with_upstream(bridge(UserAuthMode::Disabled, false), upstream);
    let response = send(bridge, get("/api/kubernetes/api/v1/namespaces?limit=10")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "namespaces");
}

#[tokio::test]
async fn test_k8s_proxy_bare_mount() {
    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().times(2).returning(|req| {
        assert_eq!(req.uri().path(), "/");
        Ok(Response::new(Body::empty()))
    });

    let bridge = Arc::new(with_upstream(bridge(UserAuthMode::Disabled, false), upstream));
    for uri in ["/api/kubernetes", "/api/kubernetes/"] {
        let response = router(bridge.clone()).oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_k8s_proxy_passes_upstream_status() {
    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().returning(|_| {
        Ok(Response::builder()
            .status(StatusCode::FORBIDDEN)
            .body(Body::from("forbidden"))
            .unwrap())
    });

    let bridge = with_upstream(bridge(UserAuthMode::Disabled, false), upstream);
    let request = axum::http::Request::builder()
        .method(Method::DELETE)
        .uri("/api/kubernetes/api/v1/namespaces/default")
        .body(Body::empty())
        .unwrap();
    let response = send(bridge, request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_k8s_proxy_transport_error_is_bad_gateway() {
    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .returning(|_| Err(Error::Proxy("connection refused".into())));

    let bridge = with_upstream(bridge(UserAuthMode::Disabled, false), upstream);
    let response = send(bridge, get("/api/kubernetes/version")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_sibling_path_not_proxied() {
    let upstream = MockUpstreamClient::new();
    let bridge = with_upstream(bridge(UserAuthMode::Disabled, false), upstream);
    let response = send(bridge, get("/api/kubernetesx/version")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dot_segments_never_reach_upstream() {
    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().times(0);

    let bridge = Arc::new(with_upstream(bridge(UserAuthMode::Disabled, false), upstream));
    for uri in [
        "/api/kubernetes/../version",
        "/api/kubernetes/%2e%2e/version",
        "/api/kubernetes/api/v1/%2E%2E/%2e%2e/healthz",
    ] {
        let response = router(bridge.clone()).oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}

#[tokio::test]
async fn test_dex_mount_rejects_dot_segments() {
    let bridge = Arc::new(bridge(UserAuthMode::Oidc, false));
    for uri in ["/api/dex/../token", "/api/dex/%2e%2e/token"] {
        let request = axum::http::Request::builder()
            .uri(uri)
            .header(header::COOKIE, format!("{}=id-token", SESSION_COOKIE_NAME))
            .body(Body::empty())
            .unwrap();
        let response = router(bridge.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}

#[tokio::test]
async fn test_dex_mount_only_with_oidc() {
    let response = send(bridge(UserAuthMode::Disabled, false), get("/api/dex/keys")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
