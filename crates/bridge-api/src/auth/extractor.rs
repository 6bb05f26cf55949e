//! Bearer-token extraction strategies
//!
//! A [`TokenExtractor`] decides which credential a Director injects into
//! the outbound request. The set of strategies is closed:
//!
//! - `Cookie`: the console session cookie set by a successful OIDC login
//! - `Constant`: a fixed service-account or static bearer token
//! - `Passthrough`: the caller's own `Authorization: Bearer` value
//!
//! Extraction is pure and never fails; `None` means "unauthenticated" and the
//! request is forwarded without credentials for the upstream to reject.

use std::fmt;

use axum::http::{header, HeaderMap};
use cookie::Cookie;
use zeroize::Zeroizing;

/// Name of the cookie carrying the console session's ID token
pub const SESSION_COOKIE_NAME: &str = "bridge-session-token";

/// Strategy for pulling a bearer credential out of an inbound request
#[derive(Clone)]
pub enum TokenExtractor {
    /// Read the named session cookie
    Cookie {
        /// Cookie name
        name: String,
    },
    /// Always yield the configured token
    Constant(Zeroizing<String>),
    /// Forward the inbound bearer token verbatim
    Passthrough,
}

impl TokenExtractor {
    /// Extractor reading the console session cookie
    pub fn session_cookie() -> Self {
        TokenExtractor::Cookie {
            name: SESSION_COOKIE_NAME.to_string(),
        }
    }

    /// Extractor yielding a fixed token
    pub fn constant(token: impl Into<String>) -> Self {
        TokenExtractor::Constant(Zeroizing::new(token.into()))
    }

    /// Pull the credential out of the request headers
    pub fn extract(&self, headers: &HeaderMap) -> Option<Zeroizing<String>> {
        match self {
            TokenExtractor::Cookie { name } => extract_cookie(headers, name),
            TokenExtractor::Constant(token) => Some(token.clone()),
            TokenExtractor::Passthrough => {
                extract_bearer_token(headers).map(|t| Zeroizing::new(t.to_string()))
            }
        }
    }
}

impl fmt::Debug for TokenExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenExtractor::Cookie { name } => f.debug_struct("Cookie").field("name", name).finish(),
            TokenExtractor::Constant(_) => f.write_str("Constant(<redacted>)"),
            TokenExtractor::Passthrough => f.write_str("Passthrough"),
        }
    }
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// Find a non-empty cookie value across every `Cookie` header
fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<Zeroizing<String>> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(|c| c.ok())
        .find(|c| c.name() == name && !c.value().is_empty())
        .map(|c| Zeroizing::new(c.value().to_string()))
}
