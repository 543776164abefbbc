use std::{convert::Infallible, time::Duration};

use thiserror::Error;

/// The error type returned by jobs and callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An invalid configuration value, e.g. a concurrency limit which isn't a positive integer.
///
/// Rejecting a value never changes the existing configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Zero or negative.
    #[error("limit must be positive, got {0}")]
    NotPositive(String),

    /// Not a whole, finite number.
    #[error("limit must be an integer, got {0:?}")]
    NotAnInteger(String),

    /// Doesn't fit in a `usize`.
    #[error("limit {0} is too large")]
    TooLarge(String),

    /// A job timeout which isn't a positive number of seconds.
    #[error("job timeout must be a positive number of seconds, got {0:?}")]
    InvalidTimeout(String),
}

/// A job ran for longer than the configured job timeout and was cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("job timed out after {0:?}")]
pub struct TimedOut(pub Duration);

impl From<Infallible> for ConfigError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}
