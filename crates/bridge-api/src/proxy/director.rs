//! Request direction
//!
//! A [`Director`] turns an inbound request into the request sent upstream:
//! denylisted, hop-by-hop and `Host` headers are dropped, the extracted
//! credential becomes the outbound `Authorization`, and the URI is rewritten
//! onto the target endpoint.

use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Request, Uri};
use url::Url;
use zeroize::Zeroizing;

use crate::auth::TokenExtractor;
use crate::error::Error;
use crate::routing::single_joining_slash;

/// Connection-scoped headers that must not be forwarded by a proxy
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any listed in `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Whether `path` has a `.` or `..` segment, plain or percent-encoded.
///
/// Backslashes count as separators since URL parsing treats them as `/`
/// for http(s).
fn has_dot_segment(path: &str) -> bool {
    let decoded = path
        .replace("%2e", ".")
        .replace("%2E", ".")
        .replace("%5c", "/")
        .replace("%5C", "/")
        .replace('\\', "/");
    decoded.split('/').any(|segment| segment == "." || segment == "..")
}

/// Rewrites requests for one proxy target
///
/// Stateless after construction; safe to share across concurrent requests.
#[derive(Debug, Clone)]
pub struct Director {
    extractor: TokenExtractor,
    endpoint: Url,
    header_denylist: Vec<HeaderName>,
}

impl Director {
    pub(crate) fn new(
        extractor: TokenExtractor,
        endpoint: Url,
        header_denylist: Vec<HeaderName>,
    ) -> Self {
        Self {
            extractor,
            endpoint,
            header_denylist,
        }
    }

    /// Get the token extractor
    pub fn extractor(&self) -> &TokenExtractor {
        &self.extractor
    }

    /// Rewrite `request` for the upstream.
    ///
    /// The request path must already be relative to the proxy mount point;
    /// it is appended to the endpoint's path with single-slash joining. The
    /// query string and body are left untouched.
    pub fn direct<B>(&self, request: Request<B>) -> Result<Request<B>, Error> {
        let (mut parts, body) = request.into_parts();

        // Read the credential before the denylist removes its source
        let token = self.extractor.extract(&parts.headers);

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        for name in &self.header_denylist {
            parts.headers.remove(name);
        }

        match token {
            Some(token) => {
                let bearer = Zeroizing::new(format!("Bearer {}", token.as_str()));
                let mut value = HeaderValue::from_str(&bearer)
                    .map_err(|_| Error::Internal("credential is not a valid header value".into()))?;
                value.set_sensitive(true);
                parts.headers.insert(header::AUTHORIZATION, value);
            }
            None => {
                parts.headers.remove(header::AUTHORIZATION);
            }
        }

        parts.uri = self.target_uri(&parts.uri)?;

        Ok(Request::from_parts(parts, body))
    }

    /// Map a mount-relative URI onto the endpoint.
    ///
    /// Dot segments are refused rather than resolved, so the result always
    /// stays under the endpoint's path.
    fn target_uri(&self, uri: &Uri) -> Result<Uri, Error> {
        if has_dot_segment(uri.path()) {
            return Err(Error::BadRequest(format!(
                "path {} contains a dot segment",
                uri.path()
            )));
        }

        let mut url = self.endpoint.clone();
        let path = single_joining_slash(self.endpoint.path(), uri.path());
        url.set_path(&path);
        url.set_query(uri.query());

        url.as_str()
            .parse()
            .map_err(|e| Error::Internal(format!("invalid upstream URI {}: {}", url, e)))
    }
}
