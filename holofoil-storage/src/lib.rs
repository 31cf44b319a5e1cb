//! Local persistence for the Holofoil plugin host.
//!
//! - [`KvStore`]: the transactional key-value seam, with a SQLite
//!   ([`SqliteKvStore`]) and an in-memory ([`MemoryKvStore`]) implementation.
//! - [`PluginCache`]: TTL and quota managed cache of manifests, assets and
//!   resolved configuration.
//! - [`PluginStorage`]: per-plugin key-value storage that survives cache
//!   clears.

pub mod cache;
pub mod error;
pub mod keys;
pub mod kv;
mod locks;
pub mod memory;
pub mod scoped;
pub mod sqlite;

pub use cache::{
    CacheQuota, CacheStats, CachedAsset, CachedConfig, CachedManifest, MaintenanceReport,
    PluginCache, PluginCacheStats,
};
pub use error::{StorageError, StorageResult};
pub use kv::{KvStore, NEVER_EXPIRES, RecordMeta, StoredRecord};
pub use memory::MemoryKvStore;
pub use scoped::{MAX_STORAGE_KEY_LEN, PluginStorage};
pub use sqlite::SqliteKvStore;
