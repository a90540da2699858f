//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// A request was denied and the caller chose to treat that as a failure
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    LimitExceeded { retry_after: u64 },

    /// Tier name that does not match any known tier
    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    /// A request weight the limiter cannot evaluate
    #[error("Invalid request weight: {0}")]
    InvalidWeight(u32),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration loading errors
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Maintenance tick failures
    #[error("Maintenance error: {0}")]
    Maintenance(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Retry hint carried by a limit-exceeded error.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            TollgateError::LimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
