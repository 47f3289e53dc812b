use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::Method;
use tracing::warn;

pub mod janitor;
pub mod key;
pub mod memory;
pub mod postgres;
pub mod sqlite;
pub mod store;

pub use key::Fingerprint;
pub use memory::MemoryCache;
pub use store::{DurableStore, PoolSettings, StoreError, TierStats};

/// Merged view served by `/cache/stats`. Entry count and bytes come from
/// the durable tier (authoritative); hits combine memory hits with memory
/// misses that became durable hits; misses are full misses after both tiers.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub entries: i64,
    pub size_bytes: i64,
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOutcome {
    pub memory_removed: usize,
    pub durable_removed: u64,
}

/// Two-tier cache: a bounded in-memory LRU in front of the relational
/// store. Reads go memory-first with promotion on a durable hit; writes go
/// durable-first so a failed durable write never leaves a memory-only ghost.
#[derive(Debug)]
pub struct LayeredCache {
    memory: Option<MemoryCache>,
    durable: DurableStore,
    default_ttl: Duration,
    durable_hits: AtomicU64,
    full_misses: AtomicU64,
}

impl LayeredCache {
    pub fn new(
        durable: DurableStore,
        memory_capacity: Option<NonZeroUsize>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            memory: memory_capacity.map(MemoryCache::new),
            durable,
            default_ttl,
            durable_hits: AtomicU64::new(0),
            full_misses: AtomicU64::new(0),
        }
    }

    /// Read through both tiers. Durable-tier failures downgrade to a miss so
    /// the caller's miss path can decide what to do.
    pub async fn get(&self, fp: &Fingerprint) -> Option<Vec<u8>> {
        if let Some(memory) = &self.memory
            && let Some(value) = memory.get(fp)
        {
            return Some(value);
        }

        match self.durable.get(fp).await {
            Ok(value) => {
                self.durable_hits.fetch_add(1, Ordering::Relaxed);
                if let Some(memory) = &self.memory {
                    memory.set(*fp, value.clone(), self.default_ttl);
                }
                Some(value)
            }
            Err(StoreError::NotFound) => {
                self.full_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                warn!(error = %err, fingerprint = %fp, "durable cache read failed; treating as miss");
                self.full_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write through: durable tier first, then memory. A durable failure
    /// propagates and leaves the memory tier untouched.
    pub async fn set(
        &self,
        fp: &Fingerprint,
        value: Vec<u8>,
        method: &Method,
        path: &str,
    ) -> Result<(), StoreError> {
        self.durable
            .set(fp, &value, method, path, self.default_ttl)
            .await?;
        if let Some(memory) = &self.memory {
            memory.set(*fp, value, self.default_ttl);
        }
        Ok(())
    }

    pub async fn delete(&self, fp: &Fingerprint) -> Result<(), StoreError> {
        if let Some(memory) = &self.memory {
            memory.delete(fp);
        }
        self.durable.delete(fp).await
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let tier = self.durable.stats().await?;
        let memory_hits = self.memory.as_ref().map(|m| m.stats().hits).unwrap_or(0);
        let hits = memory_hits + self.durable_hits.load(Ordering::Relaxed);
        let misses = self.full_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };
        Ok(CacheStats {
            entries: tier.entries,
            size_bytes: tier.size_bytes,
            hit_rate,
            hits,
            misses,
        })
    }

    pub async fn sweep_expired(&self) -> Result<SweepOutcome, StoreError> {
        let memory_removed = self
            .memory
            .as_ref()
            .map(|m| m.sweep_expired())
            .unwrap_or(0);
        let durable_removed = self.durable.sweep_expired().await?;
        Ok(SweepOutcome {
            memory_removed,
            durable_removed,
        })
    }

    /// Purges the memory tier only; used by `POST /cache/clear`.
    pub fn clear_memory(&self) {
        if let Some(memory) = &self.memory {
            memory.clear();
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.durable.ping().await
    }

    pub async fn close(&self) {
        self.durable.close().await;
    }

    #[cfg(test)]
    fn memory_tier(&self) -> Option<&MemoryCache> {
        self.memory.as_ref()
    }
}
