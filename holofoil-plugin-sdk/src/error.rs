use thiserror::Error;

/// Errors raised while moving messages across the sandbox boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sandbox channel closed")]
    Disconnected,

    #[error("unexpected message: {0}")]
    Unexpected(String),
}
