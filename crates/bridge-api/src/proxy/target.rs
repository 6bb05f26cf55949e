//! Proxy targets
//!
//! A [`ProxyTargetConfig`] is the static description of an upstream. It only
//! becomes a servable [`ProxyTarget`] through [`ProxyTargetConfig::attach`],
//! which binds its Director, so a target without a Director cannot exist.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderName};
use axum::http::{Request, Response};
use tracing::{debug, warn};
use url::Url;

use super::director::Director;
use super::forwarder::{ReqwestUpstream, UpstreamClient};
use crate::auth::TokenExtractor;
use crate::error::Error;

/// Connect timeout for upstream connections.
///
/// No total timeout is applied: watch requests stay open indefinitely.
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How an upstream's TLS certificate is verified
#[derive(Clone)]
pub enum TlsTrust {
    /// The client's built-in public roots
    DefaultRoots,
    /// Only the given PEM bundle
    RootCertificates(Vec<u8>),
    /// No verification. Development only.
    InsecureSkipVerify,
}

impl TlsTrust {
    /// A reqwest builder trusting exactly this policy
    pub fn client_builder(&self) -> Result<reqwest::ClientBuilder, Error> {
        let builder = reqwest::Client::builder();
        match self {
            TlsTrust::DefaultRoots => Ok(builder),
            TlsTrust::RootCertificates(pem) => {
                let certs = reqwest::Certificate::from_pem_bundle(pem)
                    .map_err(|e| Error::Internal(format!("invalid CA bundle: {}", e)))?;
                if certs.is_empty() {
                    return Err(Error::Internal("CA bundle contains no certificates".into()));
                }
                Ok(certs
                    .into_iter()
                    .fold(builder.tls_built_in_root_certs(false), |b, cert| {
                        b.add_root_certificate(cert)
                    }))
            }
            TlsTrust::InsecureSkipVerify => {
                warn!("TLS verification disabled for upstream; do not use in production");
                Ok(builder.danger_accept_invalid_certs(true))
            }
        }
    }
}

impl fmt::Debug for TlsTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsTrust::DefaultRoots => f.write_str("DefaultRoots"),
            TlsTrust::RootCertificates(pem) => {
                write!(f, "RootCertificates({} bytes)", pem.len())
            }
            TlsTrust::InsecureSkipVerify => f.write_str("InsecureSkipVerify"),
        }
    }
}

/// Static description of an upstream
#[derive(Debug, Clone)]
pub struct ProxyTargetConfig {
    endpoint: Url,
    tls: TlsTrust,
    header_denylist: Vec<HeaderName>,
}

impl ProxyTargetConfig {
    /// Target for `endpoint`. The denylist always starts with `Cookie`.
    pub fn new(endpoint: Url, tls: TlsTrust) -> Self {
        Self {
            endpoint,
            tls,
            header_denylist: vec![header::COOKIE],
        }
    }

    /// Also strip `name` from forwarded requests
    pub fn deny_header(mut self, name: HeaderName) -> Self {
        if !self.header_denylist.contains(&name) {
            self.header_denylist.push(name);
        }
        self
    }

    /// Get the endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Get the TLS trust policy
    pub fn tls(&self) -> &TlsTrust {
        &self.tls
    }

    /// Get the header denylist
    pub fn header_denylist(&self) -> &[HeaderName] {
        &self.header_denylist
    }

    /// Bind a Director using `extractor` and build the upstream client
    pub fn attach(self, extractor: TokenExtractor) -> Result<ProxyTarget, Error> {
        let client = self
            .tls
            .client_builder()?
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build upstream client: {}", e)))?;

        Ok(self.attach_with_client(extractor, Arc::new(ReqwestUpstream::new(client))))
    }

    /// Bind a Director using `extractor` and a caller-supplied upstream client
    pub fn attach_with_client(
        self,
        extractor: TokenExtractor,
        client: Arc<dyn UpstreamClient>,
    ) -> ProxyTarget {
        debug!(
            endpoint = %self.endpoint,
            extractor = ?extractor,
            "Attaching director to proxy target"
        );
        ProxyTarget {
            director: Director::new(extractor, self.endpoint.clone(), self.header_denylist),
            endpoint: self.endpoint,
            client,
        }
    }
}

/// An upstream with its Director attached, ready to serve
#[derive(Clone)]
pub struct ProxyTarget {
    endpoint: Url,
    director: Director,
    client: Arc<dyn UpstreamClient>,
}

impl ProxyTarget {
    /// Get the endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Get the attached Director
    pub fn director(&self) -> &Director {
        &self.director
    }

    /// Direct a mount-relative request and send it upstream.
    ///
    /// Upstream status and body come back verbatim; only transport
    /// failures are errors.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let outbound = self.director.direct(request)?;
        debug!(
            method = %outbound.method(),
            uri = %outbound.uri(),
            "Forwarding request upstream"
        );
        self.client.send(outbound).await
    }
}

impl fmt::Debug for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTarget")
            .field("endpoint", &self.endpoint.as_str())
            .field("director", &self.director)
            .finish_non_exhaustive()
    }
}
