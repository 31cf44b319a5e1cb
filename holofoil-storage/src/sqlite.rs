//! SQLite-backed [`KvStore`].
//!
//! A single `kv` table holds every record. rusqlite is synchronous, so each
//! call takes the connection on a blocking thread.

use crate::error::{StorageError, StorageResult};
use crate::kv::{KvStore, RecordMeta, StoredRecord};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Persistent key-value store backed by SQLite.
#[derive(Clone)]
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        debug!(path = %path.display(), "opened plugin store");
        Self::from_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                stored_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS kv_stored_at ON kv(stored_at);
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<StoredRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT key, value, stored_at, expires_at FROM kv WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok(StoredRecord {
                            key: row.get(0)?,
                            value: row.get(1)?,
                            stored_at: row.get(2)?,
                            expires_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn put(&self, record: StoredRecord) -> StorageResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, stored_at, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    stored_at = excluded.stored_at,
                    expires_at = excluded.expires_at",
                params![record.key, record.value, record.stored_at, record.expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> StorageResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
                for key in &keys {
                    removed += stmt.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn scan(&self, prefix: &str) -> StorageResult<Vec<RecordMeta>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            // substr comparison instead of LIKE: keys may contain '%' or '_'.
            let mut stmt = conn.prepare_cached(
                "SELECT key, length(value), stored_at, expires_at FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix], |row| {
                Ok(RecordMeta {
                    key: row.get(0)?,
                    size: row.get::<_, i64>(1)?.max(0) as u64,
                    stored_at: row.get(2)?,
                    expires_at: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
            Ok(n)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &[u8], stored_at: i64) -> StoredRecord {
        StoredRecord {
            key: key.to_string(),
            value: value.to_vec(),
            stored_at,
            expires_at: stored_at + 1_000,
        }
    }

    #[tokio::test]
    async fn put_get_replace() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.put(record("a", b"one", 1)).await.unwrap();
        store.put(record("a", b"two", 2)).await.unwrap();

        let got = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.value, b"two");
        assert_eq!(got.stored_at, 2);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_treats_like_wildcards_literally() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.put(record("plugin:a_b:config", b"x", 1)).await.unwrap();
        store.put(record("plugin:axb:config", b"yy", 1)).await.unwrap();

        let hits = store.scan("plugin:a_b:").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "plugin:a_b:config");
        assert_eq!(hits[0].size, 1);
    }

    #[tokio::test]
    async fn delete_many_counts_existing() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.put(record("k1", b"1", 1)).await.unwrap();
        store.put(record("k2", b"2", 1)).await.unwrap();

        let n = store
            .delete_many(&["k1".into(), "k2".into(), "k3".into()])
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(store.scan("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("plugins.db");
        {
            let store = SqliteKvStore::open(&path).unwrap();
            store.put(record("k", b"v", 5)).await.unwrap();
        }
        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"v");
    }
}
