//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Version mismatch (optimistic concurrency control).
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    /// A record of a different kind sits under the requested key.
    #[error("wrong kind at {key}: expected {expected}, found {found}")]
    WrongKind {
        key: String,
        expected: &'static str,
        found: String,
    },

    /// A name that cannot be used as a record key.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// Internal error (I/O, encoding).
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the same call later can succeed.
    ///
    /// A kind mismatch or an unusable name stays broken until the record
    /// itself is fixed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StoreError::WrongKind { .. } | StoreError::InvalidName(_)
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
