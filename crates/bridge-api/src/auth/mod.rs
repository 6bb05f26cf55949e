//! Authentication
//!
//! - [`extractor`]: which bearer credential a proxy hop forwards
//! - [`oidc`]: the authorization-code flow against the identity broker
//! - [`provider`]: discovery document and signing-key snapshots
//! - [`state`]: single-use login state

pub mod extractor;
pub mod oidc;
pub mod provider;
pub mod state;

pub use extractor::{extract_bearer_token, TokenExtractor, SESSION_COOKIE_NAME};
pub use oidc::{
    audience_scope, console_scopes, kubectl_scopes, Authenticator, AuthenticatorConfig,
    CallbackParams, LoginSuccess, RefreshConfig, TokenSet, OOB_REDIRECT_URL,
};
pub use provider::ProviderMetadata;
pub use state::{LoginState, LoginStateStore, DEFAULT_MAX_STATES, DEFAULT_STATE_TTL};
