//! Keyed persistent storage over sqlite.
//!
//! The daemon's durable state is a flat key space: `pod-<podId>`,
//! `pod-container-<podId>`, `vm-<podId>` and `vmdata-<vmId>`. One table,
//! get/put/delete/scan.

use std::path::Path;

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("key {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("vpod.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    /// Get a key that must exist.
    pub async fn get_required(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT key FROM kv WHERE key LIKE ? ORDER BY key")
            .bind(format!("{prefix}%"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
    }
}

/// Key layout helpers.
pub mod keys {
    pub const POD_PREFIX: &str = "pod-";
    pub const POD_CONTAINER_PREFIX: &str = "pod-container-";

    pub fn pod(pod_id: &str) -> String {
        format!("pod-{pod_id}")
    }

    pub fn pod_container(pod_id: &str) -> String {
        format!("pod-container-{pod_id}")
    }

    pub fn vm_by_pod(pod_id: &str) -> String {
        format!("vm-{pod_id}")
    }

    pub fn vm_data(vm_id: &str) -> String {
        format!("vmdata-{vm_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).await.unwrap();

        assert!(store.get("pod-a").await.unwrap().is_none());
        store.put("pod-a", b"one").await.unwrap();
        assert_eq!(store.get("pod-a").await.unwrap().unwrap(), b"one");
        store.put("pod-a", b"two").await.unwrap();
        assert_eq!(store.get("pod-a").await.unwrap().unwrap(), b"two");

        assert!(store.delete("pod-a").await.unwrap());
        assert!(!store.delete("pod-a").await.unwrap());
        assert!(store.get_required("pod-a").await.is_err());
    }

    #[tokio::test]
    async fn prefix_scan_orders_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).await.unwrap();
        store.put(&keys::pod("b"), b"{}").await.unwrap();
        store.put(&keys::pod("a"), b"{}").await.unwrap();
        store.put(&keys::vm_data("x"), b"{}").await.unwrap();
        store.put(&keys::pod_container("a"), b"c1").await.unwrap();

        let pods = store.keys_with_prefix(keys::POD_PREFIX).await.unwrap();
        assert_eq!(pods, vec!["pod-a", "pod-b", "pod-container-a"]);

        let data = store.keys_with_prefix("vmdata-").await.unwrap();
        assert_eq!(data, vec!["vmdata-x"]);
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KvStore::open(dir.path()).await.unwrap();
            store.put("vm-p1", b"vm-1").await.unwrap();
        }
        let store = KvStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("vm-p1").await.unwrap().unwrap(), b"vm-1");
    }
}
