use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use http::Method;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use super::Fingerprint;
use super::store::{PoolSettings, StoreError, TierStats};
use crate::util::unix_now;

/// SQLite is effectively single-writer, so the pool is capped low no matter
/// what the configuration asks for.
const SQLITE_MAX_OPEN_CAP: u32 = 4;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at);
CREATE INDEX IF NOT EXISTS idx_cache_entries_path ON cache_entries(path);
";

#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &str, settings: &PoolSettings) -> Result<Self> {
        let path = Path::new(path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
        }

        let max_open = settings.max_open.min(SQLITE_MAX_OPEN_CAP).max(1);
        if max_open < settings.max_open {
            warn!(
                requested = settings.max_open,
                effective = max_open,
                "capping sqlite pool size; the store is a single writer"
            );
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_open)
            .max_lifetime(Some(settings.max_lifetime))
            .idle_timeout(Some(settings.max_idle_time))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite cache at {}", path.display()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to initialize sqlite cache schema")?;

        debug!(path = %path.display(), max_open, "sqlite cache store opened");
        Ok(Self { pool })
    }

    pub async fn get(&self, fp: &Fingerprint) -> Result<Vec<u8>, StoreError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM cache_entries WHERE key = ? AND expires_at > ?")
                .bind(fp.to_hex())
                .bind(unix_now())
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        match row {
            Some((value,)) => Ok(value),
            None => Err(StoreError::NotFound),
        }
    }

    pub async fn set(
        &self,
        fp: &Fingerprint,
        value: &[u8],
        method: &Method,
        path: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = unix_now();
        let expires_at = now + ttl.as_secs() as i64;
        sqlx::query(
            "INSERT INTO cache_entries (key, value, method, path, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 method = excluded.method,
                 path = excluded.path,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
        )
        .bind(fp.to_hex())
        .bind(value)
        .bind(method.as_str())
        .bind(path)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    pub async fn delete(&self, fp: &Fingerprint) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<TierStats, StoreError> {
        let (entries, size_bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(value)), 0)
             FROM cache_entries WHERE expires_at > ?",
        )
        .bind(unix_now())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(TierStats {
            entries,
            size_bytes,
        })
    }

    pub async fn sweep_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(unix_now())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_settings() -> PoolSettings {
        PoolSettings {
            max_open: 2,
            max_idle: 1,
            max_lifetime: Duration::from_secs(300),
            max_idle_time: Duration::from_secs(60),
        }
    }

    async fn open_store(dir: &TempDir) -> SqliteStore {
        let path = dir.path().join("cache.db");
        SqliteStore::open(path.to_str().unwrap(), &pool_settings())
            .await
            .expect("open sqlite store")
    }

    fn fp(path: &str) -> Fingerprint {
        Fingerprint::derive(&Method::GET, path, b"")
    }

    #[tokio::test]
    async fn set_get_roundtrip_with_method_and_path() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .set(&fp("/a"), b"payload", &Method::GET, "/a", Duration::from_secs(60))
            .await
            .unwrap();
        let value = store.get(&fp("/a")).await.unwrap();
        assert_eq!(value, b"payload");
    }

    #[tokio::test]
    async fn expired_rows_are_not_returned() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .set(&fp("/a"), b"payload", &Method::GET, "/a", Duration::from_secs(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let err = store.get(&fp("/a")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn upsert_replaces_value_and_expiry() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .set(&fp("/a"), b"old", &Method::GET, "/a", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set(&fp("/a"), b"new", &Method::POST, "/a", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get(&fp("/a")).await.unwrap(), b"new");
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size_bytes, 3);
    }

    #[tokio::test]
    async fn sweep_removes_expired_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .set(&fp("/live"), b"live", &Method::GET, "/live", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set(&fp("/dead"), b"dead", &Method::GET, "/dead", Duration::from_secs(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.sweep_expired().await.unwrap(), 0);
        assert!(store.get(&fp("/live")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_twice_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .set(&fp("/a"), b"payload", &Method::GET, "/a", Duration::from_secs(60))
            .await
            .unwrap();
        store.delete(&fp("/a")).await.unwrap();
        store.delete(&fp("/a")).await.unwrap();
        assert!(matches!(
            store.get(&fp("/a")).await.unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.ping().await.unwrap();
    }
}
