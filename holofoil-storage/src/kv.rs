//! Key-value backing store abstraction.
//!
//! Every record carries its write time and expiry (milliseconds since the
//! Unix epoch) so sweeps and eviction can be planned from metadata alone,
//! without reading values.

use crate::error::StorageResult;
use async_trait::async_trait;

/// Expiry used for records that never expire.
pub const NEVER_EXPIRES: i64 = i64::MAX;

/// A full record as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub stored_at: i64,
    pub expires_at: i64,
}

impl StoredRecord {
    pub fn size(&self) -> u64 {
        self.value.len() as u64
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at <= now_millis
    }
}

/// Record metadata returned by scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub key: String,
    pub size: u64,
    pub stored_at: i64,
    pub expires_at: i64,
}

impl RecordMeta {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at <= now_millis
    }
}

/// Local, transactional, asynchronous key-value store.
///
/// Multi-key operations are atomic: either all listed keys are affected or
/// none are.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<StoredRecord>>;

    /// Inserts or replaces a record.
    async fn put(&self, record: StoredRecord) -> StorageResult<()>;

    /// Deletes a record. Returns whether it existed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Deletes several records in one transaction. Returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> StorageResult<usize>;

    /// Lists metadata of every record whose key starts with `prefix`,
    /// ordered by key.
    async fn scan(&self, prefix: &str) -> StorageResult<Vec<RecordMeta>>;

    /// Deletes every record whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;
}
