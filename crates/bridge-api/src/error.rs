//! Error types for the auth proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::config::ConfigError;

/// Result type for auth proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for auth proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid startup configuration; fatal before serving
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// OIDC discovery or signing-key fetch failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Authentication failed (invalid state, token or code)
    #[error("authentication failed: {0}")]
    Unauthorized(#[from] AuthFailure),

    /// Request cannot be forwarded as given
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Too many logins in flight; retry later
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Failed to reach the upstream of a proxy target
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Discovery(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Proxy(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Return K8s-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.to_string(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Non-sensitive reason an OIDC login did not complete.
///
/// The reason code is the only detail placed in the error-endpoint redirect,
/// so variants carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    /// Callback arrived without a state parameter
    #[error("missing login state")]
    MissingState,
    /// State was never issued or was already consumed
    #[error("unknown or reused login state")]
    InvalidState,
    /// State was issued but its lifetime elapsed
    #[error("expired login state")]
    ExpiredState,
    /// Callback arrived without an authorization code
    #[error("missing authorization code")]
    MissingCode,
    /// The identity broker reported an error on the callback
    #[error("identity provider returned an error")]
    ProviderError,
    /// Authorization-code exchange was rejected or failed
    #[error("token exchange failed")]
    TokenExchangeFailed,
    /// ID token signature or claims failed validation
    #[error("invalid id token")]
    InvalidToken,
    /// Provider metadata is not available yet
    #[error("identity provider unavailable")]
    ProviderUnavailable,
}

impl AuthFailure {
    /// Reason code used in the `error` query parameter
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::MissingState => "missing_state",
            AuthFailure::InvalidState => "invalid_state",
            AuthFailure::ExpiredState => "expired_state",
            AuthFailure::MissingCode => "missing_code",
            AuthFailure::ProviderError => "provider_error",
            AuthFailure::TokenExchangeFailed => "token_exchange_failed",
            AuthFailure::InvalidToken => "invalid_token",
            AuthFailure::ProviderUnavailable => "provider_unavailable",
        }
    }

    /// Parse a reason code back into a failure
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "missing_state" => Some(AuthFailure::MissingState),
            "invalid_state" => Some(AuthFailure::InvalidState),
            "expired_state" => Some(AuthFailure::ExpiredState),
            "missing_code" => Some(AuthFailure::MissingCode),
            "provider_error" => Some(AuthFailure::ProviderError),
            "token_exchange_failed" => Some(AuthFailure::TokenExchangeFailed),
            "invalid_token" => Some(AuthFailure::InvalidToken),
            "provider_unavailable" => Some(AuthFailure::ProviderUnavailable),
            _ => None,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthFailure {
    fn from(_: jsonwebtoken::errors::Error) -> Self {
        AuthFailure::InvalidToken
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Proxy(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_codes_are_distinct() {
        let all = [
            AuthFailure::MissingState,
            AuthFailure::InvalidState,
            AuthFailure::ExpiredState,
            AuthFailure::MissingCode,
            AuthFailure::ProviderError,
            AuthFailure::TokenExchangeFailed,
            AuthFailure::InvalidToken,
            AuthFailure::ProviderUnavailable,
        ];
        let codes: std::collections::HashSet<_> = all.iter().map(|f| f.code()).collect();
        assert_eq!(codes.len(), all.len());
        for failure in all {
            assert_eq!(AuthFailure::from_code(failure.code()), Some(failure));
        }
        assert_eq!(AuthFailure::from_code("token=abc"), None);
    }

    #[tokio::test]
    async fn test_error_into_response_status_document() {
        let response = Error::Proxy("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "Status");
        assert_eq!(json["code"], 502);
        assert_eq!(json["status"], "Failure");
    }

    #[test]
    fn test_request_and_capacity_statuses() {
        assert_eq!(
            Error::BadRequest("dot segment".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Overloaded("login states".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_unauthorized_from_auth_failure() {
        let err: Error = AuthFailure::InvalidState.into();
        assert!(matches!(err, Error::Unauthorized(AuthFailure::InvalidState)));
        assert!(err.to_string().contains("reused"));
    }
}
