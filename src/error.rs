//! Error types for the Floodgate service.

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// Overload is not an error: a rejected request is reported as
/// [`Decision::Rejected`](crate::admission::Decision::Rejected).
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors, raised at construction time only
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for FloodgateError {
    fn from(err: serde_yaml::Error) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
