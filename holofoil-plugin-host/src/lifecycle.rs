//! Plugin lifecycle states and the transitions between them.
//!
//! ```text
//! discovered → validating → validated → permission-pending → sandboxed → ready
//!                                                                         ↓
//!                                               unloaded ← active ⇄ inactive
//! ```
//!
//! `error` is reachable from every state except `unloaded`. Both `error` and
//! `unloaded` may re-enter `validating` on reload.

use crate::error::{PluginHostError, Result};
use holofoil_types::PluginId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginState {
    Discovered,
    Validating,
    Validated,
    PermissionPending,
    Sandboxed,
    Ready,
    Active,
    Inactive,
    Unloaded,
    Error,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Validating => "validating",
            Self::Validated => "validated",
            Self::PermissionPending => "permission-pending",
            Self::Sandboxed => "sandboxed",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unloaded => "unloaded",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(self, to: PluginState) -> bool {
        use PluginState::*;
        match (self, to) {
            (Unloaded, Error) => false,
            (Error, Error) => false,
            (_, Error) => true,
            (Discovered | Unloaded | Error, Validating) => true,
            (Validating, Validated) => true,
            (Validated, PermissionPending) => true,
            (PermissionPending, Sandboxed) => true,
            (Sandboxed, Ready) => true,
            (Ready | Inactive, Active) => true,
            (Active, Inactive) => true,
            (Unloaded, Unloaded) => false,
            (_, Unloaded) => true,
            _ => false,
        }
    }

    /// Checked transition. Returns the new state.
    pub fn transition(self, plugin_id: &PluginId, to: PluginState) -> Result<PluginState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(PluginHostError::InvalidTransition {
                plugin_id: plugin_id.to_string(),
                from: self,
                to,
            })
        }
    }

    /// States in which the plugin owns a live sandbox.
    pub fn has_sandbox(self) -> bool {
        matches!(self, Self::Sandboxed | Self::Ready | Self::Active | Self::Inactive)
    }

    /// A load is in progress.
    pub fn is_loading(self) -> bool {
        matches!(
            self,
            Self::Validating | Self::Validated | Self::PermissionPending | Self::Sandboxed
        )
    }

    /// Ready to be (re)activated.
    pub fn is_activatable(self) -> bool {
        matches!(self, Self::Ready | Self::Inactive)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
