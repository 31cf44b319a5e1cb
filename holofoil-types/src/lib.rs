//! Core type definitions for Holofoil.
//!
//! This crate defines the plugin-agnostic types shared by the storage layer,
//! the guest SDK and the plugin host:
//! - Plugin identifiers (restricted charset, safe to embed in storage keys)
//! - Trust tiers
//! - The plugin manifest data model and its entry point payloads
//! - A clock abstraction so expiry logic can be driven by tests

mod clock;
mod ids;
mod manifest;
mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{PluginId, MAX_PLUGIN_ID_LEN};
pub use manifest::{
    AssetDecl, EntryPointKind, EntryPoints, MechanicEntry, PluginManifest, SettingField,
    SettingKind, SettingsEntry, SourceEntry, ThemeEntry,
};
pub use tier::TrustTier;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid plugin id '{id}': {reason}")]
    InvalidPluginId { id: String, reason: &'static str },

    #[error("unknown trust tier: {0}")]
    UnknownTier(String),
}
