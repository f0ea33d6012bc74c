//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with existing resource or with its current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Request failed validation.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Internal(format!("serialization: {e}"))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
