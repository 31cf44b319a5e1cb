//! Host policy: administrator-managed plugin allow/deny lists and
//! capabilities that are refused outright, without a consent prompt.

use crate::capabilities::Capability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only listed plugins may load.
    Allowlist,
    /// Every plugin except the listed ones may load.
    Denylist,
    #[default]
    Unrestricted,
}

/// `[policy]` section of the host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    /// Allowlisted ids in allowlist mode, blocked ids in denylist mode.
    pub plugin_ids: Vec<String>,
    /// Capabilities no plugin is granted, whatever its tier.
    pub denied_capabilities: BTreeSet<Capability>,
    /// Builtin plugins bypass the plugin lists (capability denials still apply).
    pub exempt_builtins: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Unrestricted,
            plugin_ids: Vec::new(),
            denied_capabilities: BTreeSet::new(),
            exempt_builtins: true,
        }
    }
}

/// Answers policy questions for the loader and permission manager.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// No restrictions at all.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_plugin_allowed(&self, plugin_id: &str, builtin: bool) -> bool {
        if builtin && self.config.exempt_builtins {
            return true;
        }
        let listed = self.config.plugin_ids.iter().any(|id| id == plugin_id);
        match self.config.mode {
            PolicyMode::Unrestricted => true,
            PolicyMode::Allowlist => listed,
            PolicyMode::Denylist => !listed,
        }
    }

    /// A denied capability is moved straight to `denied`; the user is never asked.
    pub fn is_capability_denied_by_policy(&self, capability: Capability) -> bool {
        self.config.denied_capabilities.contains(&capability)
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_allows_all() {
        let engine = PolicyEngine::unrestricted();
        assert!(engine.is_plugin_allowed("anything", false));
        assert!(!engine.is_capability_denied_by_policy(Capability::Network));
    }

    #[test]
    fn allowlist_mode() {
        let engine = PolicyEngine::new(PolicyConfig {
            mode: PolicyMode::Allowlist,
            plugin_ids: vec!["curated.binder".into()],
            ..Default::default()
        });
        assert!(engine.is_plugin_allowed("curated.binder", false));
        assert!(!engine.is_plugin_allowed("community.evil", false));
        assert!(engine.is_plugin_allowed("holofoil.theme.classic", true));
    }

    #[test]
    fn denylist_mode() {
        let engine = PolicyEngine::new(PolicyConfig {
            mode: PolicyMode::Denylist,
            plugin_ids: vec!["community.evil".into()],
            ..Default::default()
        });
        assert!(!engine.is_plugin_allowed("community.evil", false));
        assert!(engine.is_plugin_allowed("community.fine", false));
    }

    #[test]
    fn denied_capabilities() {
        let engine = PolicyEngine::new(PolicyConfig {
            denied_capabilities: [Capability::Network].into_iter().collect(),
            ..Default::default()
        });
        assert!(engine.is_capability_denied_by_policy(Capability::Network));
        assert!(!engine.is_capability_denied_by_policy(Capability::Storage));
    }
}
