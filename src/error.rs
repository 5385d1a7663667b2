//! Error types for Turnstile.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Admission itself never fails; every variant here is raised while
/// building limiters or loading configuration.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// A policy was declared with a limit of zero requests
    #[error("Invalid limit: at least one request per window must be allowed")]
    InvalidLimit,

    /// A policy was declared with an empty window
    #[error("Invalid window: {0:?} is not a positive duration")]
    InvalidWindow(Duration),

    /// The reclamation tick was set to zero
    #[error("Invalid cleanup interval: {0:?} is not a positive duration")]
    InvalidCleanupInterval(Duration),

    /// A lookup named a policy that was never configured
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The background reclamation task needs a Tokio runtime
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
