//! Plugin-scoped key-value storage backing the `storage` host API.
//!
//! Records live under `storage:{id}:{key}`, never expire, and are not
//! touched by cache clears.

use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::kv::{KvStore, NEVER_EXPIRES, StoredRecord};
use crate::locks::KeyLocks;
use holofoil_types::{Clock, PluginId, SystemClock};
use serde_json::Value;
use std::sync::Arc;

/// Longest key a plugin may use.
pub const MAX_STORAGE_KEY_LEN: usize = 256;

pub struct PluginStorage {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl PluginStorage {
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

    pub async fn get(&self, plugin: &PluginId, key: &str) -> StorageResult<Option<Value>> {
        check_key(key)?;
        let Some(record) = self.store.get(&keys::storage_key(plugin, key)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&record.value)?))
    }

    /// Stores a value, refusing writes that would push the plugin past `limit` bytes.
    pub async fn set(
        &self,
        plugin: &PluginId,
        key: &str,
        value: &Value,
        limit: Option<u64>,
    ) -> StorageResult<()> {
        check_key(key)?;
        let full_key = keys::storage_key(plugin, key);
        let bytes = serde_json::to_vec(value)?;
        let _guard = self.locks.acquire(&full_key).await;

        if let Some(limit) = limit {
            let used: u64 = self
                .store
                .scan(&keys::storage_prefix(plugin))
                .await?
                .iter()
                .filter(|m| m.key != full_key)
                .map(|m| m.size)
                .sum();
            let requested = bytes.len() as u64;
            if used + requested > limit {
                return Err(StorageError::QuotaExceeded {
                    plugin_id: plugin.to_string(),
                    used,
                    requested,
                    limit,
                });
            }
        }

        self.store
            .put(StoredRecord {
                key: full_key,
                value: bytes,
                stored_at: self.clock.now_millis(),
                expires_at: NEVER_EXPIRES,
            })
            .await
    }

    pub async fn remove(&self, plugin: &PluginId, key: &str) -> StorageResult<bool> {
        check_key(key)?;
        let full_key = keys::storage_key(plugin, key);
        let _guard = self.locks.acquire(&full_key).await;
        self.store.delete(&full_key).await
    }

    /// Bytes currently stored by a plugin.
    pub async fn usage(&self, plugin: &PluginId) -> StorageResult<u64> {
        Ok(self
            .store
            .scan(&keys::storage_prefix(plugin))
            .await?
            .iter()
            .map(|m| m.size)
            .sum())
    }

    /// Deletes everything a plugin stored. Used on uninstall.
    pub async fn clear(&self, plugin: &PluginId) -> StorageResult<usize> {
        self.store.delete_prefix(&keys::storage_prefix(plugin)).await
    }
}

fn check_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_STORAGE_KEY_LEN {
        return Err(StorageError::InvalidKey(format!(
            "storage keys must be 1..={MAX_STORAGE_KEY_LEN} bytes"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(StorageError::InvalidKey(
            "storage keys may not contain control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvStore;
    use serde_json::json;

    #[tokio::test]
    async fn quota_excludes_the_key_being_replaced() {
        let storage = PluginStorage::new(Arc::new(MemoryKvStore::new()));
        let id = PluginId::parse("community.notes").unwrap();

        storage.set(&id, "note", &json!("abcd"), Some(8)).await.unwrap();
        storage.set(&id, "note", &json!("efgh"), Some(8)).await.unwrap();
        let err = storage.set(&id, "other", &json!("ijkl"), Some(8)).await;
        assert!(matches!(err, Err(StorageError::QuotaExceeded { .. })));
        assert_eq!(storage.get(&id, "note").await.unwrap(), Some(json!("efgh")));
    }

    #[test]
    fn rejects_empty_keys() {
        let storage = PluginStorage::new(Arc::new(MemoryKvStore::new()));
        let id = PluginId::parse("community.notes").unwrap();
        assert!(matches!(
            tokio_test::block_on(storage.get(&id, "")),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
