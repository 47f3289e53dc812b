use std::time::Duration;

use anyhow::{Context, Result};
use http::Method;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use super::Fingerprint;
use super::store::{PoolSettings, StoreError, TierStats};
use crate::util::unix_now;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BYTEA NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    expires_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at);
CREATE INDEX IF NOT EXISTS idx_cache_entries_path ON cache_entries(path);
";

#[derive(Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn open(dsn: &str, settings: &PoolSettings) -> Result<Self> {
        anyhow::ensure!(!dsn.is_empty(), "postgres backend requires a DSN");

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_open.max(1))
            .min_connections(settings.max_idle.min(settings.max_open))
            .max_lifetime(Some(settings.max_lifetime))
            .idle_timeout(Some(settings.max_idle_time))
            .connect(dsn)
            .await
            .context("failed to connect to postgres cache")?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to initialize postgres cache schema")?;

        debug!(max_open = settings.max_open, "postgres cache store opened");
        Ok(Self { pool })
    }

    pub async fn get(&self, fp: &Fingerprint) -> Result<Vec<u8>, StoreError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM cache_entries WHERE key = $1 AND expires_at > $2")
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
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (key) DO UPDATE SET
                 value = EXCLUDED.value,
                 method = EXCLUDED.method,
                 path = EXCLUDED.path,
                 created_at = EXCLUDED.created_at,
                 expires_at = EXCLUDED.expires_at",
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
        sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<TierStats, StoreError> {
        let (entries, size_bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(OCTET_LENGTH(value)), 0)::BIGINT
             FROM cache_entries WHERE expires_at > $1",
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
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= $1")
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
