//! Kubernetes API proxying against a mock upstream

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use tower::ServiceExt;
use wiremock::matchers::{body_string, header as has_header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zeroize::Zeroizing;

use bridge_api::auth::SESSION_COOKIE_NAME;
use bridge_api::config::{BridgeOptions, K8sAuthMode, ProxyMode};
use bridge_api::{router, Bridge, TlsTrust};

fn bridge(upstream: &MockServer, k8s_auth: K8sAuthMode) -> Arc<Bridge> {
    bridge_for(upstream.uri(), k8s_auth)
}

fn bridge_for(endpoint: String, k8s_auth: K8sAuthMode) -> Arc<Bridge> {
    let options = BridgeOptions {
        k8s_mode: ProxyMode::OffCluster,
        k8s_mode_off_cluster_endpoint: endpoint,
        k8s_auth,
        k8s_auth_bearer_token: Zeroizing::new("static-token".into()),
        ..BridgeOptions::default()
    };
    let config = options.validate().unwrap();
    Arc::new(Bridge::assemble(&config, None, TlsTrust::DefaultRoots, None).unwrap())
}

async fn send(bridge: &Arc<Bridge>, request: Request<Body>) -> Response {
    router(bridge.clone()).oneshot(request).await.unwrap()
}

async fn body_string_of(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_bearer_token_injected() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pods"))
        .and(query_param("labelSelector", "app=web"))
        .and(has_header("authorization", "Bearer static-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"kind":"PodList"}"#))
        .expect(1)
        .mount(&upstream)
        .await;

    let bridge = bridge(&upstream, K8sAuthMode::BearerToken);
    let response = send(
        &bridge,
        Request::builder()
            .uri("/api/kubernetes/api/v1/pods?labelSelector=app%3Dweb")
            .header(header::AUTHORIZATION, "Bearer caller-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string_of(response).await, r#"{"kind":"PodList"}"#);
}

#[tokio::test]
async fn test_passthrough_forwards_caller_token() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .and(has_header("authorization", "Bearer caller-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let bridge = bridge(&upstream, K8sAuthMode::Passthrough);
    let response = send(
        &bridge,
        Request::builder()
            .uri("/api/kubernetes/version")
            .header(header::AUTHORIZATION, "Bearer caller-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cookie_never_reaches_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let bridge = bridge(&upstream, K8sAuthMode::BearerToken);
    let response = send(
        &bridge,
        Request::builder()
            .uri("/api/kubernetes/api")
            .header(
                header::COOKIE,
                format!("{}=session-jwt; theme=dark", SESSION_COOKIE_NAME),
            )
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("cookie").is_none());
}

#[tokio::test]
async fn test_request_body_streamed_upstream() {
    let upstream = MockServer::start().await;
    let manifest = r#"{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"demo"}}"#;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces"))
        .and(body_string(manifest))
        .respond_with(ResponseTemplate::new(201).set_body_string(manifest))
        .expect(1)
        .mount(&upstream)
        .await;

    let bridge = bridge(&upstream, K8sAuthMode::BearerToken);
    let response = send(
        &bridge,
        Request::builder()
            .method("POST")
            .uri("/api/kubernetes/api/v1/namespaces")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(manifest))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_string_of(response).await, manifest);
}

#[tokio::test]
async fn test_upstream_error_status_passed_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/secrets"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&upstream)
        .await;

    let bridge = bridge(&upstream, K8sAuthMode::BearerToken);
    let response = send(
        &bridge,
        Request::builder()
            .uri("/api/kubernetes/api/v1/secrets")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string_of(response).await, "forbidden");
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    // Reserve a port, then release it so nothing is listening there
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let bridge = bridge_for(format!("http://{}", addr), K8sAuthMode::BearerToken);

    let response = send(
        &bridge,
        Request::builder()
            .uri("/api/kubernetes/version")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_str(&body_string_of(response).await).unwrap();
    assert_eq!(body["kind"], "Status");
    assert_eq!(body["code"], 502);
}

#[tokio::test]
async fn test_dot_segments_rejected_before_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let bridge = bridge(&upstream, K8sAuthMode::BearerToken);
    for uri in ["/api/kubernetes/api/../version", "/api/kubernetes/api/%2e%2e/version"] {
        let response = send(
            &bridge,
            Request::builder().uri(uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}
