//! Error types for event log sync

use thiserror::Error;

/// Result type alias for event log sync operations
pub type Result<T> = std::result::Result<T, EventLogError>;

/// Main error type shared across the workspace
#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown event log category: {0}")]
    UnknownCategory(String),

    #[error("Invalid sync state: {0}")]
    InvalidState(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
