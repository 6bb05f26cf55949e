//! Shared utilities for bridge: logging setup and backoff scheduling

#![deny(missing_docs)]

pub mod retry;
pub mod telemetry;

pub use retry::{Backoff, BackoffConfig};
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig, TelemetryError};
