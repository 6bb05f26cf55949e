//! Exponential backoff with jitter.
//!
//! Background loops that poll an external service (OIDC discovery, signing
//! keys) use [`Backoff`] to space out attempts after failures without
//! hammering a degraded dependency.
//!
//! # Example
//!
//! ```ignore
//! use bridge_common::retry::{Backoff, BackoffConfig};
//!
//! let mut backoff = Backoff::new(BackoffConfig::default());
//! loop {
//!     match refresh().await {
//!         Ok(()) => backoff.reset(),
//!         Err(_) => tokio::time::sleep(backoff.next_delay()).await,
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;

/// Configuration for retrying an operation that may fail transiently.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the delay between retries
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

/// Stateful backoff schedule.
///
/// Each call to [`Backoff::next_delay`] returns the current delay with
/// 0.5x to 1.5x jitter applied, then grows the base delay up to `max_delay`.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Start a new schedule at `config.initial_delay`
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        // Jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);

        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        jittered.min(self.config.max_delay)
    }

    /// Un-jittered delay the next call will be based on
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return to the initial delay after a success
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}
