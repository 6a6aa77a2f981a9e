use thiserror::Error;

/// Common error type for PulseBridge components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid upstream target: {0}")]
    InvalidTarget(String),
}

/// Result type alias using PulseBridge's Error.
pub type Result<T> = std::result::Result<T, Error>;
