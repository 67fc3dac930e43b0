//! Error types for the Ratekeeper gateway.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
///
/// An admission denial is not an error; it is the `allowed == false` branch of
/// a [`Decision`](crate::ratelimit::Decision).
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while assembling configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// The shared admission store could not be reached or answered badly
    #[error("Admission store unavailable: {0}")]
    StoreUnavailable(String),

    /// The inbound request could not be read
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The upstream could not be reached or broke off mid-response
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for RatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        RatekeeperError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
