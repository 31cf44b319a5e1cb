//! Plugin manifest (`plugin.json`) data model.
//!
//! This is the typed form. Untrusted input is checked by the host's
//! validator against the raw JSON first; only a manifest that passed
//! validation is deserialized into these types.

use crate::{PluginId, TrustTier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Declarative descriptor of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier (e.g. "community.foil-shimmer").
    pub id: PluginId,
    /// Human-readable plugin name.
    pub name: String,
    /// Semver version string.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Relative path of the plugin's code, if it ships any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// Trust-tier hint. The host may lower it, never raise it.
    #[serde(default)]
    pub tier: TrustTier,
    #[serde(default)]
    pub entry_points: EntryPoints,
    /// Capability ids requested by this plugin.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub assets: Vec<AssetDecl>,
}

impl PluginManifest {
    /// Returns the kinds of entry point this plugin exposes.
    pub fn entry_point_kinds(&self) -> Vec<EntryPointKind> {
        let mut kinds = Vec::new();
        if self.entry_points.theme.is_some() {
            kinds.push(EntryPointKind::Theme);
        }
        if self.entry_points.mechanic.is_some() {
            kinds.push(EntryPointKind::Mechanic);
        }
        if self.entry_points.settings.is_some() {
            kinds.push(EntryPointKind::Settings);
        }
        if self.entry_points.source.is_some() {
            kinds.push(EntryPointKind::Source);
        }
        kinds
    }

    pub fn has_entry_points(&self) -> bool {
        !self.entry_point_kinds().is_empty()
    }

    /// Sum of the declared asset sizes.
    pub fn declared_asset_bytes(&self) -> u64 {
        self.assets.iter().map(|a| a.size).sum()
    }

    /// Returns true if the manifest requests the given capability id.
    pub fn requests(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// The four surfaces a plugin can plug into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryPoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<ThemeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanic: Option<MechanicEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPointKind {
    Theme,
    Mechanic,
    Settings,
    Source,
}

impl EntryPointKind {
    pub const ALL: [EntryPointKind; 4] = [
        EntryPointKind::Theme,
        EntryPointKind::Mechanic,
        EntryPointKind::Settings,
        EntryPointKind::Source,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Theme => "theme",
            Self::Mechanic => "mechanic",
            Self::Settings => "settings",
            Self::Source => "source",
        }
    }
}

/// Theme entry point: CSS custom properties plus an optional stylesheet asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeEntry {
    pub name: String,
    /// CSS custom property name (without the leading `--`) to value.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Relative asset path of an extra stylesheet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stylesheet: Option<String>,
}

/// Mini-game entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MechanicEntry {
    /// Mechanic id, unique within the plugin.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Minimum number of cards the collection must hold to play.
    #[serde(default)]
    pub min_cards: u32,
}

/// Settings schema entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsEntry {
    /// Group heading under which the fields are shown.
    pub group: String,
    #[serde(default)]
    pub fields: Vec<SettingField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingField {
    pub key: String,
    pub label: String,
    pub kind: SettingKind,
    #[serde(default)]
    pub default: Value,
}

/// Value type of a setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SettingKind {
    Toggle,
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Text {
        #[serde(default)]
        max_length: Option<usize>,
    },
    Select {
        options: Vec<String>,
    },
}

impl SettingKind {
    /// Returns `true` if `value` is acceptable for a setting of this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Toggle, Value::Bool(_)) => true,
            (Self::Number { min, max }, Value::Number(n)) => {
                let Some(n) = n.as_f64() else {
                    return false;
                };
                min.is_none_or(|m| n >= m) && max.is_none_or(|m| n <= m)
            }
            (Self::Text { max_length }, Value::String(s)) => {
                max_length.is_none_or(|m| s.chars().count() <= m)
            }
            (Self::Select { options }, Value::String(s)) => options.iter().any(|o| o == s),
            _ => false,
        }
    }
}

/// Collection data-source entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Source id, unique within the plugin.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Endpoint the host networking layer fetches from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// A file shipped with the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDecl {
    /// Path relative to the plugin root.
    pub path: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> PluginManifest {
        serde_json::from_value(json!({
            "id": "community.foil-shimmer",
            "name": "Foil Shimmer",
            "version": "1.2.0",
            "entry_points": {
                "theme": { "name": "Shimmer", "variables": { "card-bg": "#101820" } },
                "settings": {
                    "group": "Shimmer",
                    "fields": [
                        { "key": "intensity", "label": "Intensity",
                          "kind": { "type": "number", "min": 0.0, "max": 1.0 }, "default": 0.5 }
                    ]
                }
            },
            "capabilities": ["storage"],
            "assets": [{ "path": "shimmer.css", "size": 2048 }]
        }))
        .unwrap()
    }

    #[test]
    fn defaults_to_community_tier() {
        assert_eq!(sample().tier, TrustTier::Community);
    }

    #[test]
    fn entry_point_kinds_in_fixed_order() {
        assert_eq!(
            sample().entry_point_kinds(),
            vec![EntryPointKind::Theme, EntryPointKind::Settings]
        );
    }

    #[test]
    fn declared_bytes_sum() {
        assert_eq!(sample().declared_asset_bytes(), 2048);
    }

    #[test]
    fn setting_kind_accepts() {
        let number = SettingKind::Number {
            min: Some(0.0),
            max: Some(1.0),
        };
        assert!(number.accepts(&json!(0.25)));
        assert!(!number.accepts(&json!(2)));
        assert!(!number.accepts(&json!("0.5")));

        let select = SettingKind::Select {
            options: vec!["grid".into(), "list".into()],
        };
        assert!(select.accepts(&json!("grid")));
        assert!(!select.accepts(&json!("carousel")));

        assert!(SettingKind::Toggle.accepts(&json!(true)));
        assert!(SettingKind::Text { max_length: Some(3) }.accepts(&json!("abc")));
        assert!(!SettingKind::Text { max_length: Some(3) }.accepts(&json!("abcd")));
    }
}
