//! Error types for the plugin host.

use crate::lifecycle::PluginState;
use holofoil_plugin_sdk::{ProtocolError, WorkerError};
use holofoil_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PluginHostError>;

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("validation failed for '{plugin_id}': {summary}")]
    Validation { plugin_id: String, summary: String },

    #[error("permission denied: plugin '{plugin_id}' lacks '{capability}' capability")]
    PermissionDenied {
        plugin_id: String,
        capability: String,
    },

    #[error("capability '{capability}' is not available to {tier} plugins")]
    TierBlocked { capability: String, tier: String },

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("sandbox for '{plugin_id}' failed to start: {message}")]
    SandboxInit { plugin_id: String, message: String },

    #[error("timeout: plugin '{plugin_id}' exceeded {timeout_ms}ms deadline")]
    SandboxTimeout { plugin_id: String, timeout_ms: u64 },

    #[error("sandbox for '{0}' has been terminated")]
    SandboxTerminated(String),

    #[error("plugin crashed: {plugin_id}: {message}")]
    SandboxCrashed { plugin_id: String, message: String },

    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelationId(u64),

    #[error("plugin '{plugin_id}' returned {error}")]
    Worker {
        plugin_id: String,
        error: WorkerError,
    },

    #[error("no handler installed for '{0}'")]
    HandlerUnavailable(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("invalid setting '{key}' for '{plugin_id}': {reason}")]
    InvalidSetting {
        plugin_id: String,
        key: String,
        reason: String,
    },

    #[error("unknown collection source: {0}")]
    UnknownSource(String),

    #[error("plugin '{plugin_id}' cannot go from {from} to {to}")]
    InvalidTransition {
        plugin_id: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("load of '{0}' was cancelled")]
    LoadCancelled(String),

    #[error("cache error: {0}")]
    Cache(#[from] StorageError),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginHostError {
    /// Sandbox start failures, timeouts and network errors may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SandboxInit { .. } | Self::SandboxTimeout { .. } | Self::Network(_)
        )
    }

    /// Explanation suitable for showing to the end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { plugin_id, .. } => {
                format!("'{plugin_id}' failed safety checks and was not loaded.")
            }
            Self::PermissionDenied {
                plugin_id,
                capability,
            } => format!("'{plugin_id}' is not allowed to use {capability}."),
            Self::TierBlocked { capability, tier } => {
                format!("{tier} plugins cannot use {capability}.")
            }
            Self::PolicyDenied(_) => "Blocked by your administrator's plugin policy.".into(),
            Self::SandboxInit { plugin_id, .. } => {
                format!("'{plugin_id}' could not be started. Try again later.")
            }
            Self::SandboxTimeout { plugin_id, .. } => {
                format!("'{plugin_id}' took too long to respond.")
            }
            Self::SandboxTerminated(plugin_id) => format!("'{plugin_id}' is not running."),
            Self::SandboxCrashed { plugin_id, .. } => format!("'{plugin_id}' stopped unexpectedly."),
            Self::PluginNotFound(plugin_id) => format!("No plugin named '{plugin_id}'."),
            Self::Network(_) => "A network error occurred. Check your connection and retry.".into(),
            Self::InvalidTransition { plugin_id, .. } => {
                format!("'{plugin_id}' is busy. Try again in a moment.")
            }
            Self::Worker { plugin_id, .. } => format!("'{plugin_id}' reported an error."),
            _ => "Something went wrong with a plugin.".into(),
        }
    }
}

impl From<reqwest::Error> for PluginHostError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}
