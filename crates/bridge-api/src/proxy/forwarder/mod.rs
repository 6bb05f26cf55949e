//! Upstream round trip
//!
//! Sends a directed request upstream and streams the answer back. Bodies are
//! never buffered in either direction, so watch and log-follow responses
//! flow chunk by chunk for as long as the upstream keeps them open.
//!
//! # Cancellation
//!
//! The downstream response body owns the upstream byte stream. When the
//! client disconnects, the server drops that body, which drops the reqwest
//! stream and closes the upstream connection.
//!
//! # Dependency Injection
//!
//! [`UpstreamClient`] is the seam between request direction and the network;
//! tests inject a mock instead of reaching a real API server.

use async_trait::async_trait;
use axum::body::{Body, Bytes, HttpBody};
use axum::http::{Request, Response};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use super::director::strip_hop_by_hop;
use crate::error::Error;

// ============================================================================
// Traits for Dependency Injection
// ============================================================================

/// Performs the network round trip for a directed request
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send `request` (already carrying its absolute upstream URI) and return
    /// the upstream response with a streaming body
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, Error>;
}

// ============================================================================
// Reqwest implementation
// ============================================================================

/// [`UpstreamClient`] backed by a reqwest client
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    /// Wrap a configured client
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstream {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let (parts, body) = request.into_parts();

        let mut builder = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers);

        if !body.is_end_stream() {
            builder = builder.body(reqwest::Body::wrap_stream(request_body_stream(body)));
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "Upstream request failed");
            Error::Proxy(format!("failed to reach upstream: {}", e))
        })?;

        downstream_response(response)
    }
}

/// Pump the inbound body into a channel the outbound request can own.
///
/// The pump ends as soon as either side goes away.
fn request_body_stream(body: Body) -> mpsc::Receiver<Result<Bytes, axum::Error>> {
    let (mut tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            if tx.send(chunk).await.is_err() {
                debug!("Upstream stopped reading request body");
                break;
            }
        }
    });
    rx
}

/// Convert an upstream response into a streaming downstream response
fn downstream_response(response: reqwest::Response) -> Result<Response<Body>, Error> {
    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);

    debug!(status = %status, "Streaming upstream response");

    let mut downstream = Response::builder()
        .status(status)
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))?;
    *downstream.headers_mut() = headers;

    Ok(downstream)
}
