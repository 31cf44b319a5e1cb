//! Settings adapter: plugin settings schemas and their current values.

use crate::error::{PluginHostError, Result};
use holofoil_types::{PluginId, PluginManifest, SettingField, SettingsEntry};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

/// One field with its effective value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingView {
    #[serde(flatten)]
    pub field: SettingField,
    pub value: Value,
}

/// Settings of one plugin, as shown in the settings UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsGroup {
    pub plugin_id: PluginId,
    pub group: String,
    pub fields: Vec<SettingView>,
}

#[derive(Default)]
struct State {
    schemas: BTreeMap<PluginId, SettingsEntry>,
    /// Values survive unregistering so re-activation restores them.
    values: HashMap<PluginId, Map<String, Value>>,
}

#[derive(Default)]
pub struct SettingsAdapter {
    state: RwLock<State>,
}

impl SettingsAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the plugin's settings schema. Returns `false` if it has none.
    pub fn register_plugin_settings(&self, plugin_id: &PluginId, manifest: &PluginManifest) -> bool {
        let Some(entry) = &manifest.entry_points.settings else {
            return false;
        };
        let mut state = self.write();
        state.schemas.insert(plugin_id.clone(), entry.clone());
        debug!(plugin_id = %plugin_id, fields = entry.fields.len(), "registered plugin settings");
        true
    }

    pub fn unregister_plugin_settings(&self, plugin_id: &PluginId) -> bool {
        self.write().schemas.remove(plugin_id).is_some()
    }

    /// All registered groups, ordered by plugin id.
    pub fn get_grouped_plugin_settings(&self) -> Vec<SettingsGroup> {
        let state = self.read();
        state
            .schemas
            .iter()
            .map(|(plugin_id, entry)| {
                let stored = state.values.get(plugin_id);
                SettingsGroup {
                    plugin_id: plugin_id.clone(),
                    group: entry.group.clone(),
                    fields: entry
                        .fields
                        .iter()
                        .map(|field| SettingView {
                            value: stored
                                .and_then(|v| v.get(&field.key))
                                .cloned()
                                .unwrap_or_else(|| field.default.clone()),
                            field: field.clone(),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Current value, falling back to the schema default.
    pub fn get_plugin_setting_value(&self, plugin_id: &PluginId, key: &str) -> Result<Value> {
        let state = self.read();
        let field = find_field(&state, plugin_id, key)?;
        Ok(state
            .values
            .get(plugin_id)
            .and_then(|v| v.get(key))
            .cloned()
            .unwrap_or_else(|| field.default.clone()))
    }

    /// Sets a value after checking it against the field's type.
    pub fn set_plugin_setting_value(&self, plugin_id: &PluginId, key: &str, value: Value) -> Result<()> {
        let mut state = self.write();
        let field = find_field(&state, plugin_id, key)?;
        if !field.kind.accepts(&value) {
            return Err(PluginHostError::InvalidSetting {
                plugin_id: plugin_id.to_string(),
                key: key.to_string(),
                reason: format!("{value} does not match the field type"),
            });
        }
        state
            .values
            .entry(plugin_id.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Stored values as one JSON object, for caching as resolved config.
    pub fn values_for(&self, plugin_id: &PluginId) -> Value {
        Value::Object(self.read().values.get(plugin_id).cloned().unwrap_or_default())
    }

    /// Restores values read back from the cache. Entries that no longer fit
    /// the schema are dropped.
    pub fn restore_values(&self, plugin_id: &PluginId, values: &Value) {
        let Some(obj) = values.as_object() else {
            return;
        };
        let mut state = self.write();
        let Some(schema) = state.schemas.get(plugin_id) else {
            return;
        };
        let kept: Map<String, Value> = obj
            .iter()
            .filter(|(k, v)| {
                schema
                    .fields
                    .iter()
                    .any(|f| &f.key == *k && f.kind.accepts(v))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        state.values.insert(plugin_id.clone(), kept);
    }

    /// Forgets schema and values. Used on uninstall.
    pub fn forget(&self, plugin_id: &PluginId) {
        let mut state = self.write();
        state.schemas.remove(plugin_id);
        state.values.remove(plugin_id);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn find_field<'a>(state: &'a State, plugin_id: &PluginId, key: &str) -> Result<&'a SettingField> {
    let schema = state
        .schemas
        .get(plugin_id)
        .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
    schema
        .fields
        .iter()
        .find(|f| f.key == key)
        .ok_or_else(|| PluginHostError::InvalidSetting {
            plugin_id: plugin_id.to_string(),
            key: key.to_string(),
            reason: "no such setting".into(),
        })
}
