use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Bounded in-process cache tier: a recency-ordered map with per-entry
/// expiry. All mutating operations (including `get`, which refreshes
/// recency) run under one lock; hit/miss counters are plain atomics so
/// `stats` reads stay tear-tolerant without taking it.
#[derive(Debug)]
pub struct MemoryCache {
    inner: Mutex<MemoryState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug)]
struct MemoryState {
    lru: LruCache<super::Fingerprint, MemoryEntry>,
    bytes: u64,
}

#[derive(Debug)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub count: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

impl MemoryCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                lru: LruCache::new(capacity),
                bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached value and refreshes the entry's recency position.
    /// Expired entries are removed and reported as a miss.
    pub fn get(&self, fp: &super::Fingerprint) -> Option<Vec<u8>> {
        let mut state = self.inner.lock();
        let expired = match state.lru.peek(fp) {
            Some(entry) => Instant::now() > entry.expires_at,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            if let Some(removed) = state.lru.pop(fp) {
                state.bytes = state.bytes.saturating_sub(removed.value.len() as u64);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match state.lru.get(fp) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Creates or replaces an entry with `expiry = now + ttl`, refreshing
    /// recency. The LRU tail is evicted when the count would exceed capacity.
    pub fn set(&self, fp: super::Fingerprint, value: Vec<u8>, ttl: Duration) {
        let entry = MemoryEntry {
            expires_at: Instant::now() + ttl,
            value,
        };
        let mut state = self.inner.lock();
        state.bytes = state.bytes.saturating_add(entry.value.len() as u64);
        if let Some((_old_key, old)) = state.lru.push(fp, entry) {
            // Either a replacement of the same key or an eviction of the tail.
            state.bytes = state.bytes.saturating_sub(old.value.len() as u64);
        }
    }

    pub fn delete(&self, fp: &super::Fingerprint) {
        let mut state = self.inner.lock();
        if let Some(removed) = state.lru.pop(fp) {
            state.bytes = state.bytes.saturating_sub(removed.value.len() as u64);
        }
    }

    /// Removes expired entries, scanning from least to most recently used.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.lock();
        let expired: Vec<super::Fingerprint> = state
            .lru
            .iter()
            .rev()
            .filter(|(_, entry)| now > entry.expires_at)
            .map(|(fp, _)| *fp)
            .collect();
        for fp in &expired {
            if let Some(removed) = state.lru.pop(fp) {
                state.bytes = state.bytes.saturating_sub(removed.value.len() as u64);
            }
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.lru.clear();
        state.bytes = 0;
    }

    pub fn stats(&self) -> MemoryStats {
        let (count, bytes) = {
            let state = self.inner.lock();
            (state.lru.len(), state.bytes)
        };
        MemoryStats {
            count,
            bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
