//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking task running a transaction panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),

    /// A lock guarding the connection was poisoned by a panicking writer.
    #[error("storage lock poisoned")]
    Poisoned,

    /// Key does not follow the `plugin:{id}:...` / `storage:{id}:...` layout.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Plugin-scoped storage would exceed its byte quota.
    #[error("quota exceeded for '{plugin_id}': {used} + {requested} > {limit} bytes")]
    QuotaExceeded {
        plugin_id: String,
        used: u64,
        requested: u64,
        limit: u64,
    },
}
