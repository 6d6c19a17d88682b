//! Error types for chatrelay

use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors (file, environment, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Completion provider errors surfaced outside the retry loop
    #[error("Provider error: {0}")]
    Provider(String),

    /// Listener, router and WebSocket errors
    #[error("Server error: {0}")]
    Server(String),

    /// Client frame or provider document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
