use std::time::Duration;

use anyhow::{Result, bail};
use http::Method;
use thiserror::Error;

use super::Fingerprint;
use super::postgres::PostgresStore;
use super::sqlite::SqliteStore;

/// Errors surfaced by the durable tier. `NotFound` is a plain miss and is
/// never treated as a failure above the layered cache; `Unavailable` covers
/// pool exhaustion, dead handles and network faults; `Corrupt` marks rows
/// that failed to decode.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache entry not found")]
    NotFound,
    #[error("cache store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("cache entry corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub(super) fn from_sqlx(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::ColumnDecode { index, source } => {
                StoreError::Corrupt(format!("column {index}: {source}"))
            }
            sqlx::Error::Decode(source) => StoreError::Corrupt(source.to_string()),
            other => StoreError::Unavailable(other),
        }
    }
}

/// Connection-pool bounds shared by both backends.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Duration,
    pub max_idle_time: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TierStats {
    pub entries: i64,
    pub size_bytes: i64,
}

/// The relational tier behind the memory cache. Two concrete backends, one
/// closed set of operations; composition elsewhere is static.
#[derive(Debug)]
pub enum DurableStore {
    Sqlite(SqliteStore),
    Postgres(PostgresStore),
}

impl DurableStore {
    pub async fn open(backend: &str, path_or_dsn: &str, pool: &PoolSettings) -> Result<Self> {
        match backend {
            "sqlite" | "" => Ok(Self::Sqlite(SqliteStore::open(path_or_dsn, pool).await?)),
            "postgres" | "postgresql" => {
                Ok(Self::Postgres(PostgresStore::open(path_or_dsn, pool).await?))
            }
            other => bail!("unsupported cache backend '{other}'"),
        }
    }

    pub async fn get(&self, fp: &Fingerprint) -> Result<Vec<u8>, StoreError> {
        match self {
            Self::Sqlite(store) => store.get(fp).await,
            Self::Postgres(store) => store.get(fp).await,
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
        match self {
            Self::Sqlite(store) => store.set(fp, value, method, path, ttl).await,
            Self::Postgres(store) => store.set(fp, value, method, path, ttl).await,
        }
    }

    pub async fn delete(&self, fp: &Fingerprint) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(store) => store.delete(fp).await,
            Self::Postgres(store) => store.delete(fp).await,
        }
    }

    pub async fn stats(&self) -> Result<TierStats, StoreError> {
        match self {
            Self::Sqlite(store) => store.stats().await,
            Self::Postgres(store) => store.stats().await,
        }
    }

    pub async fn sweep_expired(&self) -> Result<u64, StoreError> {
        match self {
            Self::Sqlite(store) => store.sweep_expired().await,
            Self::Postgres(store) => store.sweep_expired().await,
        }
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(store) => store.ping().await,
            Self::Postgres(store) => store.ping().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Sqlite(store) => store.close().await,
            Self::Postgres(store) => store.close().await,
        }
    }
}
