//! Install registry.
//!
//! Records which plugins are installed, where they came from, the user's
//! per-plugin preferences and the settled permission grants. Lives in its
//! own JSON document so clearing the plugin cache never loses it. Every
//! change is written to a temporary file and renamed over the old one.

use crate::error::Result;
use crate::permissions::PermissionSnapshot;
use chrono::{DateTime, Utc};
use holofoil_types::{Clock, PluginId, SystemClock, TrustTier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REGISTRY_VERSION: u32 = 1;

/// Where a plugin was installed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PluginOrigin {
    /// Ships with the application.
    Bundled,
    /// The curated plugin registry.
    Registry { url: String },
    /// A URL or file supplied by the user.
    User { url: String },
}

impl PluginOrigin {
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Bundled => None,
            Self::Registry { url } | Self::User { url } => Some(url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPluginInfo {
    pub plugin_id: PluginId,
    pub name: String,
    pub version: String,
    pub tier: TrustTier,
    pub origin: PluginOrigin,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginPreferences {
    pub enabled: bool,
    /// Active when the host last shut down.
    pub last_active: bool,
}

impl Default for PluginPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            last_active: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    info: InstalledPluginInfo,
    #[serde(default)]
    preferences: PluginPreferences,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    #[serde(default)]
    plugins: BTreeMap<PluginId, RegistryEntry>,
    #[serde(default)]
    permissions: PermissionSnapshot,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            plugins: BTreeMap::new(),
            permissions: PermissionSnapshot::default(),
        }
    }
}

pub struct InstallRegistry {
    path: Option<PathBuf>,
    doc: Mutex<RegistryDocument>,
    clock: Arc<dyn Clock>,
}

impl InstallRegistry {
    /// Opens the registry at `path`. A missing file starts empty; an
    /// unreadable one starts empty with a warning and is replaced on the
    /// next write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<RegistryDocument>(&bytes) {
                Ok(doc) => {
                    debug!(path = %path.display(), plugins = doc.plugins.len(), "install registry loaded");
                    doc
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "install registry unreadable, starting empty");
                    RegistryDocument::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryDocument::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
            clock,
        })
    }

    /// A registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(RegistryDocument::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records an install or update. Preferences and the original install
    /// time survive updates.
    pub async fn record_install(
        &self,
        plugin_id: &PluginId,
        name: &str,
        version: &str,
        tier: TrustTier,
        origin: PluginOrigin,
    ) -> Result<InstalledPluginInfo> {
        let now = self.clock.now();
        let mut doc = self.doc.lock().await;
        let (installed_at, preferences) = doc
            .plugins
            .get(plugin_id)
            .map(|e| (e.info.installed_at, e.preferences.clone()))
            .unwrap_or((now, PluginPreferences::default()));
        let info = InstalledPluginInfo {
            plugin_id: plugin_id.clone(),
            name: name.to_string(),
            version: version.to_string(),
            tier,
            origin,
            installed_at,
            updated_at: now,
        };
        doc.plugins.insert(
            plugin_id.clone(),
            RegistryEntry {
                info: info.clone(),
                preferences,
            },
        );
        self.persist(&doc).await?;
        info!(plugin_id = %plugin_id, version = %version, "plugin installed");
        Ok(info)
    }

    /// Forgets a plugin and its permission grants.
    pub async fn remove(&self, plugin_id: &PluginId) -> Result<Option<InstalledPluginInfo>> {
        let mut doc = self.doc.lock().await;
        let removed = doc.plugins.remove(plugin_id).map(|e| e.info);
        doc.permissions.plugins.remove(plugin_id);
        if removed.is_some() {
            self.persist(&doc).await?;
        }
        Ok(removed)
    }

    pub async fn get(&self, plugin_id: &PluginId) -> Option<InstalledPluginInfo> {
        self.doc.lock().await.plugins.get(plugin_id).map(|e| e.info.clone())
    }

    pub async fn list(&self) -> Vec<InstalledPluginInfo> {
        self.doc
            .lock()
            .await
            .plugins
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Preferences of a plugin; defaults if it is not installed.
    pub async fn preferences(&self, plugin_id: &PluginId) -> PluginPreferences {
        self.doc
            .lock()
            .await
            .plugins
            .get(plugin_id)
            .map(|e| e.preferences.clone())
            .unwrap_or_default()
    }

    /// Returns `false` if the plugin is not installed.
    pub async fn set_enabled(&self, plugin_id: &PluginId, enabled: bool) -> Result<bool> {
        self.update_preferences(plugin_id, |p| p.enabled = enabled).await
    }

    pub async fn set_last_active(&self, plugin_id: &PluginId, last_active: bool) -> Result<bool> {
        self.update_preferences(plugin_id, |p| p.last_active = last_active).await
    }

    pub async fn last_active_ids(&self) -> Vec<PluginId> {
        self.doc
            .lock()
            .await
            .plugins
            .iter()
            .filter(|(_, e)| e.preferences.last_active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn permissions(&self) -> PermissionSnapshot {
        self.doc.lock().await.permissions.clone()
    }

    pub async fn save_permissions(&self, snapshot: PermissionSnapshot) -> Result<()> {
        let mut doc = self.doc.lock().await;
        if doc.permissions == snapshot {
            return Ok(());
        }
        doc.permissions = snapshot;
        self.persist(&doc).await
    }

    async fn update_preferences(
        &self,
        plugin_id: &PluginId,
        update: impl FnOnce(&mut PluginPreferences),
    ) -> Result<bool> {
        let mut doc = self.doc.lock().await;
        let Some(entry) = doc.plugins.get_mut(plugin_id) else {
            return Ok(false);
        };
        let before = entry.preferences.clone();
        update(&mut entry.preferences);
        if entry.preferences != before {
            self.persist(&doc).await?;
        }
        Ok(true)
    }

    async fn persist(&self, doc: &RegistryDocument) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capability;
    use crate::permissions::{GrantState, PermissionGrant, PluginGrantSnapshot};

    fn id(s: &str) -> PluginId {
        PluginId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("installed.json");

        let registry = InstallRegistry::open(&path).await.unwrap();
        registry
            .record_install(
                &id("curated.binder"),
                "Binder",
                "1.0.0",
                TrustTier::Curated,
                PluginOrigin::Registry { url: "https://plugins.test/binder".into() },
            )
            .await
            .unwrap();
        registry.set_last_active(&id("curated.binder"), true).await.unwrap();

        let mut grants = BTreeMap::new();
        grants.insert(
            Capability::Network,
            PermissionGrant { state: GrantState::Granted, updated_at: Utc::now() },
        );
        let mut snapshot = PermissionSnapshot::default();
        snapshot
            .plugins
            .insert(id("curated.binder"), PluginGrantSnapshot { tier: TrustTier::Curated, grants });
        registry.save_permissions(snapshot.clone()).await.unwrap();

        let reopened = InstallRegistry::open(&path).await.unwrap();
        let info = reopened.get(&id("curated.binder")).await.unwrap();
        assert_eq!(info.version, "1.0.0");
        assert_eq!(info.origin.url(), Some("https://plugins.test/binder"));
        assert_eq!(reopened.last_active_ids().await, vec![id("curated.binder")]);
        assert_eq!(reopened.permissions().await, snapshot);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn update_keeps_preferences_and_install_time() {
        let registry = InstallRegistry::in_memory();
        let p = id("community.grid");
        let first = registry
            .record_install(&p, "Grid", "1.0.0", TrustTier::Community, PluginOrigin::Bundled)
            .await
            .unwrap();
        registry.set_enabled(&p, false).await.unwrap();
        let second = registry
            .record_install(&p, "Grid", "1.1.0", TrustTier::Community, PluginOrigin::Bundled)
            .await
            .unwrap();

        assert_eq!(second.installed_at, first.installed_at);
        assert!(!registry.preferences(&p).await.enabled);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installed.json");
        std::fs::write(&path, "{ not json").unwrap();
        let registry = InstallRegistry::open(&path).await.unwrap();
        assert!(registry.list().await.is_empty());
        assert!(!registry.set_enabled(&id("missing"), true).await.unwrap());
    }
}
