//! OIDC authorization-code flow
//!
//! An [`Authenticator`] owns one client relationship with the identity
//! broker: provider discovery, login redirects, callback code exchange, ID
//! token validation and a background metadata refresh.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► start() ──► initial discovery ──► ready ──► refresh loop
//!              │              │ fails                      │ fails
//!              │              ▼                            ▼
//!              │         fatal error              keep last-known-good
//! ```
//!
//! Readiness is monotonic: once the first discovery succeeds the
//! authenticator stays ready even if later refreshes fail.
//!
//! # Concurrency
//!
//! Provider metadata lives behind an `RwLock<Option<Arc<_>>>`. Readers clone
//! the `Arc` under the read lock and validate against that snapshot; refresh
//! builds a complete new snapshot before swapping it in under the write lock.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, decode_header, Validation};
use serde::Deserialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use zeroize::Zeroizing;

use bridge_common::retry::{Backoff, BackoffConfig};

use super::provider::ProviderMetadata;
use super::state::{LoginStateStore, DEFAULT_MAX_STATES, DEFAULT_STATE_TTL};
use crate::error::{AuthFailure, Error};

/// Redirect URL telling the broker to display the code instead of redirecting
pub const OOB_REDIRECT_URL: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Scopes requested by every login
pub const BASE_SCOPES: &[&str] = &["openid", "email", "profile"];

/// Scope requesting a refresh token
pub const OFFLINE_ACCESS_SCOPE: &str = "offline_access";

/// Synthetic scope asking the broker to add a client to the token audience
pub fn audience_scope(client_id: &str) -> String {
    format!("audience:server:client_id:{}", client_id)
}

/// Scopes for the console login.
///
/// When a kubectl client is configured, the console's and kubectl's client ids
/// are both requested as audiences so one login mints a token accepted by the
/// console and by the API server trusting kubectl's client id.
pub fn console_scopes(client_id: &str, kubectl_client_id: Option<&str>) -> Vec<String> {
    let mut scopes: Vec<String> = BASE_SCOPES.iter().map(|s| s.to_string()).collect();
    if let Some(kubectl) = kubectl_client_id {
        scopes.push(audience_scope(client_id));
        scopes.push(audience_scope(kubectl));
    }
    scopes
}

/// Scopes for the kubectl out-of-band login
pub fn kubectl_scopes() -> Vec<String> {
    BASE_SCOPES
        .iter()
        .copied()
        .chain(std::iter::once(OFFLINE_ACCESS_SCOPE))
        .map(String::from)
        .collect()
}

/// Schedule for background provider-metadata refresh
#[derive(Clone, Debug)]
pub struct RefreshConfig {
    /// Delay between refreshes while the provider is healthy
    pub interval: Duration,
    /// Backoff applied after a failed refresh
    pub backoff: BackoffConfig,
    /// Minimum age of metadata before an unknown kid forces a refresh
    pub min_key_refresh: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            backoff: BackoffConfig::default(),
            min_key_refresh: Duration::from_secs(30),
        }
    }
}

/// Configuration for one OIDC client relationship
#[derive(Clone)]
pub struct AuthenticatorConfig {
    /// Short name used in logs ("console", "kubectl")
    pub name: String,
    /// Issuer URL
    pub issuer_url: Url,
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: Zeroizing<String>,
    /// Redirect URL registered with the broker
    pub redirect_url: String,
    /// Requested scopes (always includes `openid`)
    pub scopes: Vec<String>,
    /// Browser destination after a successful callback
    pub success_url: String,
    /// Browser destination after a failed callback
    pub error_url: String,
    /// HTTP client trusting the broker's CA, with a bounded timeout
    pub http_client: reqwest::Client,
    /// Metadata refresh schedule
    pub refresh: RefreshConfig,
    /// Lifetime of an unconsumed login state
    pub state_ttl: Duration,
    /// Logins allowed in flight before new ones are refused
    pub max_pending_logins: usize,
}

impl AuthenticatorConfig {
    /// Config with default refresh schedule and state TTL
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        issuer_url: Url,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
        scopes: Vec<String>,
        success_url: impl Into<String>,
        error_url: impl Into<String>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            issuer_url,
            client_id: client_id.into(),
            client_secret: Zeroizing::new(client_secret.into()),
            redirect_url: redirect_url.into(),
            scopes,
            success_url: success_url.into(),
            error_url: error_url.into(),
            http_client,
            refresh: RefreshConfig::default(),
            state_ttl: DEFAULT_STATE_TTL,
            max_pending_logins: DEFAULT_MAX_STATES,
        }
    }
}

impl fmt::Debug for AuthenticatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatorConfig")
            .field("name", &self.name)
            .field("issuer_url", &self.issuer_url.as_str())
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Tokens minted by a successful code exchange
pub struct TokenSet {
    /// Validated ID token
    pub id_token: Zeroizing<String>,
    /// Access token
    pub access_token: Zeroizing<String>,
    /// Refresh token, when `offline_access` was granted
    pub refresh_token: Option<Zeroizing<String>>,
    /// ID token expiry
    pub expiry: SystemTime,
    /// Clients the ID token is valid for
    pub audience: Vec<String>,
    /// Subject of the ID token
    pub subject: String,
    /// Email claim, if present
    pub email: Option<String>,
}

impl TokenSet {
    /// Remaining lifetime of the ID token, zero if already expired
    pub fn remaining_lifetime(&self) -> Duration {
        self.expiry
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("subject", &self.subject)
            .field("audience", &self.audience)
            .field("expiry", &self.expiry)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful callback
#[derive(Debug)]
pub struct LoginSuccess {
    /// Tokens establishing the session
    pub token: TokenSet,
    /// Where to send the browser
    pub redirect: String,
}

/// Query parameters the broker sends to the callback endpoint
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// Echoed login state
    pub state: Option<String>,
    /// Error reported by the broker
    pub error: Option<String>,
}

/// Token endpoint response
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    id_token: Option<String>,
    refresh_token: Option<String>,
}

/// ID token claims we read after `jsonwebtoken` has checked iss/aud/exp
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    email: Option<String>,
    aud: Audience,
    exp: u64,
}

/// `aud` may be a single string or an array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    fn into_vec(self) -> Vec<String> {
        match self {
            Audience::Single(s) => vec![s],
            Audience::Multiple(v) => v,
        }
    }
}

/// One OIDC client relationship end-to-end
pub struct Authenticator {
    config: AuthenticatorConfig,
    /// Current provider snapshot; `None` until the first discovery succeeds
    metadata: RwLock<Option<Arc<ProviderMetadata>>>,
    /// Serialises refreshes
    refresh_lock: tokio::sync::Mutex<()>,
    ready: watch::Sender<bool>,
    states: LoginStateStore,
}

impl Authenticator {
    /// Create an authenticator; no network traffic until [`start`](Self::start)
    pub fn new(config: AuthenticatorConfig) -> Self {
        let states = LoginStateStore::with_limits(config.state_ttl, config.max_pending_logins);
        let (ready, _) = watch::channel(false);
        Self {
            config,
            metadata: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            ready,
            states,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &AuthenticatorConfig {
        &self.config
    }

    /// Whether the first discovery has completed
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the first discovery has completed
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Current provider metadata snapshot
    pub async fn metadata(&self) -> Result<Arc<ProviderMetadata>, AuthFailure> {
        self.metadata
            .read()
            .await
            .clone()
            .ok_or(AuthFailure::ProviderUnavailable)
    }

    /// Fetch provider metadata and swap it in.
    ///
    /// On failure the previous snapshot is left untouched.
    pub async fn discover(&self) -> Result<(), Error> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_swap().await
    }

    /// Refetch keys for an unknown kid unless a snapshot newer than `seen`
    /// is already in place, so concurrent callers share one fetch.
    async fn rediscover_since(&self, seen: Instant) -> Result<(), Error> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.metadata.read().await.as_ref().map(|m| m.fetched_at);
        if current.is_some_and(|fetched_at| fetched_at > seen) {
            return Ok(());
        }
        self.fetch_and_swap().await
    }

    async fn fetch_and_swap(&self) -> Result<(), Error> {
        let fresh =
            ProviderMetadata::fetch(&self.config.http_client, &self.config.issuer_url).await?;

        *self.metadata.write().await = Some(Arc::new(fresh));
        self.ready.send_replace(true);
        Ok(())
    }

    /// Run the initial discovery and spawn the refresh loop.
    ///
    /// Fails if the issuer cannot be discovered, since auth traffic cannot be
    /// served safely without provider metadata. The returned task ends when
    /// `shutdown` is cancelled.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, Error> {
        info!(
            authenticator = %self.config.name,
            issuer = %self.config.issuer_url,
            "Starting OIDC authenticator"
        );

        self.discover().await.map_err(|e| {
            Error::Discovery(format!(
                "initial discovery for {} authenticator failed: {}",
                self.config.name, e
            ))
        })?;

        let this = Arc::clone(self);
        Ok(tokio::spawn(this.refresh_loop(shutdown)))
    }

    /// Periodically refresh metadata until shutdown
    async fn refresh_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.refresh.interval;
        let mut backoff = Backoff::new(self.config.refresh.backoff.clone());
        let mut delay = interval;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(authenticator = %self.config.name, "Stopping metadata refresh");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.discover().await {
                Ok(()) => {
                    backoff.reset();
                    delay = interval;
                }
                Err(e) => {
                    delay = backoff.next_delay();
                    warn!(
                        authenticator = %self.config.name,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Metadata refresh failed, keeping last known provider metadata"
                    );
                }
            }
        }
    }

    /// Begin a login: issue a state and return the broker authorization URL.
    ///
    /// `return_to` is kept only if it is a same-origin relative path.
    pub async fn login(&self, return_to: Option<&str>) -> Result<String, Error> {
        // Fail before issuing state if we cannot build the redirect anyway
        let metadata = self.metadata().await?;
        let return_to = return_to.and_then(sanitize_return_to);
        let state = self.states.issue(return_to)?;
        Ok(self.authorization_url(&metadata, Some(&state)))
    }

    /// Authorization URL for an out-of-band login.
    ///
    /// No state is issued: the code comes back by hand to
    /// [`exchange_code`](Self::exchange_code), never through the callback.
    pub async fn out_of_band_url(&self) -> Result<String, Error> {
        let metadata = self.metadata().await?;
        Ok(self.authorization_url(&metadata, None))
    }

    /// Number of logins awaiting their callback
    pub fn pending_logins(&self) -> usize {
        self.states.len()
    }

    /// Authorization URL, carrying `state` when one was issued
    fn authorization_url(&self, metadata: &ProviderMetadata, state: Option<&str>) -> String {
        let mut url = metadata.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_url)
                .append_pair("scope", &self.config.scopes.join(" "));
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        url.into()
    }

    /// Complete a login from the broker's callback parameters
    pub async fn callback(&self, params: CallbackParams) -> Result<LoginSuccess, AuthFailure> {
        // Consume the state first so it cannot be replayed whatever happens next
        let state = params.state.as_deref().ok_or(AuthFailure::MissingState)?;
        let login = self.states.consume(state)?;

        if let Some(error) = params.error.as_deref() {
            warn!(
                authenticator = %self.config.name,
                provider_error = %error,
                "Identity provider rejected login"
            );
            return Err(AuthFailure::ProviderError);
        }

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(AuthFailure::MissingCode)?;

        let token = self.exchange_code(code).await?;

        info!(
            authenticator = %self.config.name,
            subject = %token.subject,
            "Login succeeded"
        );

        Ok(LoginSuccess {
            redirect: self.success_redirect(login.return_to.as_deref()),
            token,
        })
    }

    /// Redeem an authorization code and validate the resulting ID token
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet, AuthFailure> {
        let metadata = self.metadata().await?;

        let response = self
            .config
            .http_client
            .post(metadata.token_endpoint.clone())
            .basic_auth(&self.config.client_id, Some(self.config.client_secret.as_str()))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!(authenticator = %self.config.name, error = %e, "Token endpoint unreachable");
                AuthFailure::TokenExchangeFailed
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                authenticator = %self.config.name,
                status = status.as_u16(),
                "Token endpoint rejected authorization code"
            );
            return Err(AuthFailure::TokenExchangeFailed);
        }

        let tokens: TokenResponse = response.json().await.map_err(|e| {
            warn!(authenticator = %self.config.name, error = %e, "Invalid token response");
            AuthFailure::TokenExchangeFailed
        })?;

        let id_token = tokens.id_token.ok_or_else(|| {
            warn!(authenticator = %self.config.name, "Token response has no id_token");
            AuthFailure::TokenExchangeFailed
        })?;
        let id_token = Zeroizing::new(id_token);

        let claims = self.validate_id_token(&id_token).await?;
        let expiry = token_expiry(claims.exp).ok_or_else(|| {
            warn!(authenticator = %self.config.name, exp = claims.exp, "ID token expiry out of range");
            AuthFailure::InvalidToken
        })?;

        Ok(TokenSet {
            id_token,
            access_token: Zeroizing::new(tokens.access_token),
            refresh_token: tokens.refresh_token.map(Zeroizing::new),
            expiry,
            audience: claims.aud.into_vec(),
            subject: claims.sub,
            email: claims.email,
        })
    }

    /// Verify signature, issuer, audience and expiry of an ID token
    async fn validate_id_token(&self, token: &str) -> Result<IdTokenClaims, AuthFailure> {
        let header = decode_header(token)?;
        let kid = header.kid.as_deref();

        let mut metadata = self.metadata().await?;

        // Unknown kid: the provider may have rotated keys since our last fetch
        if metadata.key(kid).is_none()
            && metadata.fetched_at.elapsed() >= self.config.refresh.min_key_refresh
        {
            debug!(
                authenticator = %self.config.name,
                kid = ?kid,
                "Unknown signing key, refreshing provider metadata"
            );
            if let Err(e) = self.rediscover_since(metadata.fetched_at).await {
                warn!(authenticator = %self.config.name, error = %e, "Key refresh failed");
            }
            metadata = self.metadata().await?;
        }

        let key = metadata.key(kid).ok_or_else(|| {
            warn!(authenticator = %self.config.name, kid = ?kid, "No matching signing key");
            AuthFailure::InvalidToken
        })?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&metadata.issuer]);
        validation.set_audience(&[&self.config.client_id]);
        validation.validate_exp = true;

        let data = decode::<IdTokenClaims>(token, key, &validation).map_err(|e| {
            warn!(authenticator = %self.config.name, error = %e, "ID token validation failed");
            AuthFailure::InvalidToken
        })?;

        Ok(data.claims)
    }

    /// Success endpoint, carrying the post-login path when one was requested
    fn success_redirect(&self, return_to: Option<&str>) -> String {
        match return_to {
            Some(next) => append_query(&self.config.success_url, "next", next),
            None => self.config.success_url.clone(),
        }
    }

    /// Error endpoint carrying only the non-sensitive reason code
    pub fn error_redirect(&self, failure: AuthFailure) -> String {
        append_query(&self.config.error_url, "error", failure.code())
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// `exp` claim as a point in time, if representable
fn token_expiry(exp: u64) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_secs(exp))
}

/// Accept only same-origin absolute paths ("/x"), never "//host" or schemes
pub fn sanitize_return_to(next: &str) -> Option<String> {
    let valid = next.starts_with('/')
        && !next.starts_with("//")
        && !next.contains('\\')
        && !next.chars().any(char::is_control);
    valid.then(|| next.to_string())
}

/// Append a query pair to an absolute or relative URL
fn append_query(base: &str, key: &str, value: &str) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair(key, value);
            url.into()
        }
        Err(_) => {
            let encoded: String = url::form_urlencoded::Serializer::new(String::new())
                .append_pair(key, value)
                .finish();
            let sep = if base.contains('?') { '&' } else { '?' };
            format!("{}{}{}", base, sep, encoded)
        }
    }
}
