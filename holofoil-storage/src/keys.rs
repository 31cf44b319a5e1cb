//! Persisted key layout.
//!
//! Cache records live under `plugin:{id}:...`, plugin-scoped storage under
//! `storage:{id}:{key}`. Plugin ids never contain `:`, so the id segment is
//! always the text between the first and second separator.

use holofoil_types::PluginId;

pub const CACHE_ROOT: &str = "plugin:";
pub const STORAGE_ROOT: &str = "storage:";

/// Which cache triad a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Manifest,
    Asset,
    Config,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manifest => "manifest",
            Self::Asset => "asset",
            Self::Config => "config",
        }
    }
}

pub fn manifest_key(id: &PluginId) -> String {
    format!("{CACHE_ROOT}{id}:manifest")
}

pub fn asset_key(id: &PluginId, path: &str) -> String {
    format!("{CACHE_ROOT}{id}:asset:{path}")
}

pub fn config_key(id: &PluginId) -> String {
    format!("{CACHE_ROOT}{id}:config")
}

/// Prefix covering every cache record of one plugin.
pub fn plugin_prefix(id: &PluginId) -> String {
    format!("{CACHE_ROOT}{id}:")
}

pub fn storage_key(id: &PluginId, key: &str) -> String {
    format!("{STORAGE_ROOT}{id}:{key}")
}

pub fn storage_prefix(id: &PluginId) -> String {
    format!("{STORAGE_ROOT}{id}:")
}

/// Splits a cache key into its plugin id segment and record kind.
pub fn parse_cache_key(key: &str) -> Option<(&str, RecordKind)> {
    let rest = key.strip_prefix(CACHE_ROOT)?;
    let (plugin, tail) = rest.split_once(':')?;
    let kind = match tail {
        "manifest" => RecordKind::Manifest,
        "config" => RecordKind::Config,
        t if t.starts_with("asset:") => RecordKind::Asset,
        _ => return None,
    };
    Some((plugin, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_paths_may_contain_separators() {
        let id = PluginId::parse("community.cards").unwrap();
        let key = asset_key(&id, "https://cdn.example/a:b.png");
        assert_eq!(
            parse_cache_key(&key),
            Some(("community.cards", RecordKind::Asset))
        );
    }

    #[test]
    fn rejects_foreign_keys() {
        assert_eq!(parse_cache_key("storage:x:manifest"), None);
        assert_eq!(parse_cache_key("plugin:x:other"), None);
        assert_eq!(parse_cache_key("plugin:x"), None);
    }
}
