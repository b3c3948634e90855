//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transaction could not be committed because of concurrent changes.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Path is not absolute or contains empty components.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// Operation on a transaction that was already committed or aborted.
    #[error("transaction already finished")]
    TransactionFinished,

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
