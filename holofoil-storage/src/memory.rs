//! In-memory [`KvStore`] for tests and ephemeral hosts.

use crate::error::StorageResult;
use crate::kv::{KvStore, RecordMeta, StoredRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryKvStore {
    records: RwLock<BTreeMap<String, StoredRecord>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<StoredRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, record: StoredRecord) -> StorageResult<()> {
        self.records
            .write()
            .await
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn delete_many(&self, keys: &[String]) -> StorageResult<usize> {
        let mut records = self.records.write().await;
        Ok(keys.iter().filter(|k| records.remove(*k).is_some()).count())
    }

    async fn scan(&self, prefix: &str) -> StorageResult<Vec<RecordMeta>> {
        let records = self.records.read().await;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, r)| RecordMeta {
                key: r.key.clone(),
                size: r.size(),
                stored_at: r.stored_at,
                expires_at: r.expires_at,
            })
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|k, _| !k.starts_with(prefix));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_is_prefix_bounded() {
        let store = MemoryKvStore::new();
        for key in ["plugin:a:config", "plugin:a:manifest", "plugin:b:config"] {
            store
                .put(StoredRecord {
                    key: key.into(),
                    value: vec![0; 3],
                    stored_at: 0,
                    expires_at: 10,
                })
                .await
                .unwrap();
        }
        let hits = store.scan("plugin:a:").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(store.delete_prefix("plugin:a:").await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
    }
}
