//! Single-use login state
//!
//! Each `/auth/login` issues a random state value that the identity broker
//! echoes back on `/auth/callback`. A state is consumed at most once and only
//! within its TTL; replay after consumption or expiry is rejected.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{AuthFailure, Error};

/// Default lifetime of an unconsumed login state
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(300);

/// Default cap on outstanding login states
pub const DEFAULT_MAX_STATES: usize = 10_000;

/// Minimum spacing of sweeps triggered by a full store
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Number of random bytes in a state value
const STATE_BYTES: usize = 32;

/// A login in progress
#[derive(Clone, PartialEq, Eq)]
pub struct LoginState {
    /// Same-origin path to return to after login
    pub return_to: Option<String>,
    /// When the state stops being accepted
    pub expires_at: Instant,
}

impl fmt::Debug for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginState")
            .field("return_to", &self.return_to)
            .finish()
    }
}

/// Thread-safe, bounded store of outstanding login states.
///
/// Expired entries are swept once per TTL, or sooner (at most once per
/// second) when the store is full. A full store refuses new logins.
pub struct LoginStateStore {
    /// States indexed by their random value
    states: DashMap<String, LoginState>,
    /// Lifetime of new states
    ttl: Duration,
    /// Maximum number of outstanding states
    capacity: usize,
    /// When expired entries were last swept
    last_sweep: Mutex<Instant>,
}

impl LoginStateStore {
    /// Create a store with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_STATE_TTL)
    }

    /// Create a store with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::with_limits(ttl, DEFAULT_MAX_STATES)
    }

    /// Create a store with a custom TTL and capacity
    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
            capacity,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Generate and store a fresh state, returning its value.
    ///
    /// Fails with [`Error::Overloaded`] while the store is full of live states.
    pub fn issue(&self, return_to: Option<String>) -> Result<String, Error> {
        self.maybe_sweep();

        if self.states.len() >= self.capacity {
            warn!(capacity = self.capacity, "Login state store full, refusing login");
            return Err(Error::Overloaded("too many logins in progress".into()));
        }

        let value = generate_state()?;
        self.states.insert(
            value.clone(),
            LoginState {
                return_to,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(value)
    }

    /// Consume a state value.
    ///
    /// Removal is atomic, so of several concurrent callers presenting the
    /// same value at most one receives the state.
    pub fn consume(&self, value: &str) -> Result<LoginState, AuthFailure> {
        let (_, state) = self
            .states
            .remove(value)
            .ok_or(AuthFailure::InvalidState)?;

        if Instant::now() > state.expires_at {
            debug!("rejecting expired login state");
            return Err(AuthFailure::ExpiredState);
        }

        Ok(state)
    }

    fn maybe_sweep(&self) {
        let full = self.states.len() >= self.capacity;
        let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
        let since = last.elapsed();
        if since >= self.ttl || (full && since >= MIN_SWEEP_INTERVAL) {
            self.evict_expired();
            *last = Instant::now();
        }
    }

    /// Drop every state whose lifetime has elapsed
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.states.retain(|_, state| state.expires_at >= now);
    }

    /// Number of outstanding states
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no logins are outstanding
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for LoginStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Random, URL-safe state value
fn generate_state() -> Result<String, Error> {
    let mut raw = [0u8; STATE_BYTES];
    aws_lc_rs::rand::fill(&mut raw)
        .map_err(|_| Error::Internal("random generation failed".into()))?;
    Ok(URL_SAFE_NO_PAD.encode(raw))
}
