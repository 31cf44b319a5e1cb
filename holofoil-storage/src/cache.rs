//! Plugin cache: manifests, assets and resolved config with expiry and quota.
//!
//! The cache is never the source of truth. Expired records read as absent,
//! and a record that cannot be decoded (or whose digest no longer matches)
//! is deleted and reported as a miss.

use crate::error::StorageResult;
use crate::keys::{self, CACHE_ROOT, RecordKind};
use crate::kv::{KvStore, RecordMeta, StoredRecord};
use crate::locks::KeyLocks;
use chrono::{DateTime, Duration, Utc};
use holofoil_types::{Clock, PluginId, PluginManifest, SystemClock};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A manifest read back from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedManifest {
    pub manifest: PluginManifest,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// An asset read back from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    pub path: String,
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of `bytes`.
    pub sha256: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A resolved plugin configuration read back from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedConfig {
    pub config: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Per-plugin aggregate returned by [`PluginCache::get_cache_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginCacheStats {
    pub bytes: u64,
    pub manifests: usize,
    pub assets: usize,
    pub configs: usize,
    pub expired: usize,
    pub oldest_stored_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub total_records: usize,
    pub expired_records: usize,
    pub plugins: BTreeMap<String, PluginCacheStats>,
}

/// Byte budgets applied by [`PluginCache::perform_cache_maintenance`].
#[derive(Debug, Clone, Default)]
pub struct CacheQuota {
    /// Explicit per-plugin budgets, keyed by plugin id.
    pub per_plugin: HashMap<String, u64>,
    /// Budget for plugins without an explicit entry. `None` means unbounded.
    pub default_per_plugin: Option<u64>,
    /// Budget across all plugins.
    pub global: Option<u64>,
}

impl CacheQuota {
    pub fn for_plugin(&self, plugin_id: &str) -> Option<u64> {
        self.per_plugin
            .get(plugin_id)
            .copied()
            .or(self.default_per_plugin)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_removed: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
}

/// TTL + quota cache over a [`KvStore`].
pub struct PluginCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl PluginCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: KeyLocks::default(),
        }
    }

    // ── Manifests ────────────────────────────────────────────────

    pub async fn cache_manifest(&self, manifest: &PluginManifest, ttl: Duration) -> StorageResult<()> {
        let value = serde_json::to_vec(manifest)?;
        self.write(keys::manifest_key(&manifest.id), value, ttl).await
    }

    pub async fn get_cached_manifest(&self, id: &PluginId) -> StorageResult<Option<CachedManifest>> {
        let key = keys::manifest_key(id);
        let _guard = self.locks.acquire(&key).await;
        let Some(record) = self.read_live(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<PluginManifest>(&record.value) {
            Ok(manifest) if manifest.id == *id => Ok(Some(CachedManifest {
                manifest,
                stored_at: millis_to_datetime(record.stored_at),
                expires_at: millis_to_datetime(record.expires_at),
            })),
            Ok(_) => {
                self.discard_corrupt(&key, "manifest id mismatch").await?;
                Ok(None)
            }
            Err(e) => {
                self.discard_corrupt(&key, &e.to_string()).await?;
                Ok(None)
            }
        }
    }

    pub async fn delete_cached_manifest(&self, id: &PluginId) -> StorageResult<bool> {
        self.remove(&keys::manifest_key(id)).await
    }

    pub async fn clear_expired_manifests(&self) -> StorageResult<usize> {
        self.clear_expired_of(Some(RecordKind::Manifest)).await
    }

    // ── Assets ───────────────────────────────────────────────────

    pub async fn cache_asset(
        &self,
        id: &PluginId,
        path: &str,
        bytes: &[u8],
        ttl: Duration,
    ) -> StorageResult<()> {
        self.write(keys::asset_key(id, path), bytes.to_vec(), ttl).await
    }

    /// Reads an asset. When `expected_sha256` is given and the stored bytes
    /// no longer hash to it, the record is dropped and a miss is returned.
    pub async fn get_cached_asset(
        &self,
        id: &PluginId,
        path: &str,
        expected_sha256: Option<&str>,
    ) -> StorageResult<Option<CachedAsset>> {
        let key = keys::asset_key(id, path);
        let _guard = self.locks.acquire(&key).await;
        let Some(record) = self.read_live(&key).await? else {
            return Ok(None);
        };
        let digest = hex::encode(Sha256::digest(&record.value));
        if let Some(expected) = expected_sha256
            && !expected.eq_ignore_ascii_case(&digest)
        {
            self.discard_corrupt(&key, "asset digest mismatch").await?;
            return Ok(None);
        }
        Ok(Some(CachedAsset {
            path: path.to_string(),
            bytes: record.value,
            sha256: digest,
            stored_at: millis_to_datetime(record.stored_at),
            expires_at: millis_to_datetime(record.expires_at),
        }))
    }

    pub async fn delete_cached_asset(&self, id: &PluginId, path: &str) -> StorageResult<bool> {
        self.remove(&keys::asset_key(id, path)).await
    }

    pub async fn clear_expired_assets(&self) -> StorageResult<usize> {
        self.clear_expired_of(Some(RecordKind::Asset)).await
    }

    // ── Config ───────────────────────────────────────────────────

    pub async fn cache_config(&self, id: &PluginId, config: &Value, ttl: Duration) -> StorageResult<()> {
        let value = serde_json::to_vec(config)?;
        self.write(keys::config_key(id), value, ttl).await
    }

    pub async fn get_cached_config(&self, id: &PluginId) -> StorageResult<Option<CachedConfig>> {
        let key = keys::config_key(id);
        let _guard = self.locks.acquire(&key).await;
        let Some(record) = self.read_live(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<Value>(&record.value) {
            Ok(config) => Ok(Some(CachedConfig {
                config,
                stored_at: millis_to_datetime(record.stored_at),
                expires_at: millis_to_datetime(record.expires_at),
            })),
            Err(e) => {
                self.discard_corrupt(&key, &e.to_string()).await?;
                Ok(None)
            }
        }
    }

    pub async fn delete_cached_config(&self, id: &PluginId) -> StorageResult<bool> {
        self.remove(&keys::config_key(id)).await
    }

    pub async fn clear_expired_configs(&self) -> StorageResult<usize> {
        self.clear_expired_of(Some(RecordKind::Config)).await
    }

    /// Sweeps expired records of every kind.
    pub async fn clear_expired(&self) -> StorageResult<usize> {
        self.clear_expired_of(None).await
    }

    // ── Whole-cache operations ───────────────────────────────────

    pub async fn get_cache_stats(&self) -> StorageResult<CacheStats> {
        let now = self.clock.now_millis();
        let mut stats = CacheStats::default();
        for meta in self.store.scan(CACHE_ROOT).await? {
            let Some((plugin, kind)) = keys::parse_cache_key(&meta.key) else {
                continue;
            };
            let entry = stats.plugins.entry(plugin.to_string()).or_default();
            entry.bytes += meta.size;
            match kind {
                RecordKind::Manifest => entry.manifests += 1,
                RecordKind::Asset => entry.assets += 1,
                RecordKind::Config => entry.configs += 1,
            }
            if meta.is_expired(now) {
                entry.expired += 1;
                stats.expired_records += 1;
            }
            let stored = millis_to_datetime(meta.stored_at);
            entry.oldest_stored_at = Some(entry.oldest_stored_at.map_or(stored, |o| o.min(stored)));
            stats.total_bytes += meta.size;
            stats.total_records += 1;
        }
        Ok(stats)
    }

    /// Removes every cache record of one plugin. Plugin-scoped storage and
    /// the install registry are untouched.
    pub async fn clear_plugin_cache(&self, id: &PluginId) -> StorageResult<usize> {
        let metas = self.store.scan(&keys::plugin_prefix(id)).await?;
        let removed = self.delete_planned(metas).await?;
        info!(plugin_id = %id, records = removed.len(), "cleared plugin cache");
        Ok(removed.len())
    }

    pub async fn clear_all_plugin_cache(&self) -> StorageResult<usize> {
        let metas = self.store.scan(CACHE_ROOT).await?;
        let removed = self.delete_planned(metas).await?;
        info!(records = removed.len(), "cleared all plugin caches");
        Ok(removed.len())
    }

    /// Sweeps expired records, then evicts oldest-first (by write time)
    /// until every plugin fits its budget and the total fits the global one.
    pub async fn perform_cache_maintenance(&self, quota: &CacheQuota) -> StorageResult<MaintenanceReport> {
        let now = self.clock.now_millis();
        let mut report = MaintenanceReport::default();

        let all = self.store.scan(CACHE_ROOT).await?;
        let (expired, live): (Vec<_>, Vec<_>) = all.into_iter().partition(|m| m.is_expired(now));
        let removed = self.delete_planned(expired).await?;
        report.expired_removed = removed.len();
        report.bytes_freed += removed.iter().map(|m| m.size).sum::<u64>();

        let mut by_plugin: BTreeMap<String, Vec<RecordMeta>> = BTreeMap::new();
        for meta in live {
            if let Some((plugin, _)) = keys::parse_cache_key(&meta.key) {
                by_plugin.entry(plugin.to_string()).or_default().push(meta);
            }
        }

        let mut victims = Vec::new();
        let mut survivors = Vec::new();
        for (plugin, mut metas) in by_plugin {
            metas.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then_with(|| a.key.cmp(&b.key)));
            let mut used: u64 = metas.iter().map(|m| m.size).sum();
            let limit = quota.for_plugin(&plugin);
            for meta in metas {
                if limit.is_some_and(|l| used > l) {
                    used -= meta.size;
                    victims.push(meta);
                } else {
                    survivors.push(meta);
                }
            }
        }

        if let Some(global) = quota.global {
            survivors.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then_with(|| a.key.cmp(&b.key)));
            let mut used: u64 = survivors.iter().map(|m| m.size).sum();
            for meta in survivors {
                if used <= global {
                    break;
                }
                used -= meta.size;
                victims.push(meta);
            }
        }

        let evicted = self.delete_planned(victims).await?;
        report.evicted = evicted.len();
        report.bytes_freed += evicted.iter().map(|m| m.size).sum::<u64>();

        info!(
            expired = report.expired_removed,
            evicted = report.evicted,
            bytes_freed = report.bytes_freed,
            "cache maintenance complete"
        );
        Ok(report)
    }

    // ── Internals ────────────────────────────────────────────────

    async fn write(&self, key: String, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        let now = self.clock.now_millis();
        let _guard = self.locks.acquire(&key).await;
        debug!(key = %key, bytes = value.len(), "cache write");
        self.store
            .put(StoredRecord {
                key,
                value,
                stored_at: now,
                expires_at: now.saturating_add(ttl.num_milliseconds()),
            })
            .await
    }

    /// Returns the record unless it is missing or expired. Caller holds the key lock.
    async fn read_live(&self, key: &str) -> StorageResult<Option<StoredRecord>> {
        let record = self.store.get(key).await?;
        let now = self.clock.now_millis();
        Ok(record.filter(|r| {
            let live = !r.is_expired(now);
            if !live {
                debug!(key = %key, "cache record expired");
            }
            live
        }))
    }

    async fn discard_corrupt(&self, key: &str, reason: &str) -> StorageResult<()> {
        warn!(key = %key, reason = %reason, "dropping corrupt cache record");
        self.store.delete(key).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        let _guard = self.locks.acquire(key).await;
        self.store.delete(key).await
    }

    async fn clear_expired_of(&self, kind: Option<RecordKind>) -> StorageResult<usize> {
        let now = self.clock.now_millis();
        let expired: Vec<_> = self
            .store
            .scan(CACHE_ROOT)
            .await?
            .into_iter()
            .filter(|m| m.is_expired(now))
            .filter(|m| match kind {
                None => true,
                Some(k) => keys::parse_cache_key(&m.key).is_some_and(|(_, found)| found == k),
            })
            .collect();
        let removed = self.delete_planned(expired).await?;
        if !removed.is_empty() {
            debug!(
                kind = kind.map_or("any", |k| k.as_str()),
                records = removed.len(),
                "swept expired cache records"
            );
        }
        Ok(removed.len())
    }

    /// Deletes planned records in one transaction, skipping any that were
    /// rewritten between planning and locking.
    async fn delete_planned(&self, mut planned: Vec<RecordMeta>) -> StorageResult<Vec<RecordMeta>> {
        if planned.is_empty() {
            return Ok(planned);
        }
        planned.sort_by(|a, b| a.key.cmp(&b.key));
        planned.dedup_by(|a, b| a.key == b.key);

        let mut guards = Vec::with_capacity(planned.len());
        for meta in &planned {
            guards.push(self.locks.acquire(&meta.key).await);
        }

        let mut current = HashMap::new();
        for meta in &planned {
            if let Some(record) = self.store.get(&meta.key).await? {
                current.insert(meta.key.clone(), record.stored_at);
            }
        }
        planned.retain(|m| current.get(&m.key) == Some(&m.stored_at));

        let keys: Vec<String> = planned.iter().map(|m| m.key.clone()).collect();
        self.store.delete_many(&keys).await?;
        drop(guards);
        Ok(planned)
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
