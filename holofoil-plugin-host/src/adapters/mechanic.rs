//! Mechanic adapter: mini-games contributed by plugins.

use holofoil_types::{MechanicEntry, PluginId, PluginManifest};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginMechanic {
    pub plugin_id: PluginId,
    pub mechanic: MechanicEntry,
}

impl PluginMechanic {
    /// `{plugin}/{mechanic}`, unique across plugins.
    pub fn qualified_id(&self) -> String {
        format!("{}/{}", self.plugin_id, self.mechanic.id)
    }
}

#[derive(Default)]
pub struct MechanicAdapter {
    mechanics: RwLock<BTreeMap<String, PluginMechanic>>,
}

impl MechanicAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_mechanic_from_plugin(&self, plugin_id: &PluginId, manifest: &PluginManifest) -> bool {
        let Some(entry) = &manifest.entry_points.mechanic else {
            return false;
        };
        let mechanic = PluginMechanic {
            plugin_id: plugin_id.clone(),
            mechanic: entry.clone(),
        };
        self.mechanics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(mechanic.qualified_id(), mechanic);
        true
    }

    pub fn unregister_mechanics_from_plugin(&self, plugin_id: &PluginId) -> usize {
        let mut mechanics = self.mechanics.write().unwrap_or_else(|e| e.into_inner());
        let before = mechanics.len();
        mechanics.retain(|_, m| m.plugin_id != *plugin_id);
        before - mechanics.len()
    }

    pub fn get_all_plugin_mechanics(&self) -> Vec<PluginMechanic> {
        self.mechanics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Mechanics playable with a collection of `card_count` cards.
    pub fn playable_with(&self, card_count: usize) -> Vec<PluginMechanic> {
        self.get_all_plugin_mechanics()
            .into_iter()
            .filter(|m| m.mechanic.min_cards as usize <= card_count)
            .collect()
    }

    pub fn get(&self, qualified_id: &str) -> Option<PluginMechanic> {
        self.mechanics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(qualified_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_and_unregister() {
        let adapter = MechanicAdapter::new();
        let manifest: PluginManifest = serde_json::from_value(json!({
            "id": "community.memory",
            "name": "Memory",
            "version": "1.0.0",
            "entry_points": { "mechanic": { "id": "pairs", "name": "Pairs", "min_cards": 8 } }
        }))
        .unwrap();

        assert!(adapter.register_mechanic_from_plugin(&manifest.id, &manifest));
        assert!(adapter.get("community.memory/pairs").is_some());
        assert!(adapter.playable_with(4).is_empty());
        assert_eq!(adapter.playable_with(8).len(), 1);
        assert_eq!(adapter.unregister_mechanics_from_plugin(&manifest.id), 1);
        assert!(adapter.get_all_plugin_mechanics().is_empty());
    }
}
