//! Error types for ward-core

use thiserror::Error;

/// Result type alias using ward-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ward-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Durable queue storage could not be reached
    #[error("Queue storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Replay failed for a reason worth retrying later
    #[error("Transient network failure: {0}")]
    NetworkTransient(String),

    /// Resource body does not match its declared type or is malformed
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Resource or queue item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A queued mutation ran out of replay attempts
    #[error("Retry attempts exhausted for mutation {id} after {attempts} attempts")]
    RetryExhausted { id: String, attempts: u32 },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether the error is structural and must never be queued or retried.
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidResource(_) | Self::NotFound(_) | Self::InvalidInput(_)
        )
    }
}
