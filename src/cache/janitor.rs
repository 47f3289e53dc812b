use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use super::LayeredCache;

/// Handle to the background expiry sweeper. One long-lived task sweeps both
/// tiers on an interval; `run_now` requests an immediate out-of-band sweep
/// (used by `POST /cache/clear`).
#[derive(Clone)]
pub struct Janitor {
    trigger: Arc<Notify>,
}

impl Janitor {
    pub fn spawn(
        cache: Arc<LayeredCache>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let trigger = Arc::new(Notify::new());
        let task_trigger = trigger.clone();
        tokio::spawn(async move {
            sweep(&cache).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep(&cache).await,
                    _ = task_trigger.notified() => sweep(&cache).await,
                    _ = shutdown.changed() => {
                        debug!("cache janitor stopping");
                        break;
                    }
                }
            }
        });
        Self { trigger }
    }

    pub fn run_now(&self) {
        self.trigger.notify_one();
    }
}

async fn sweep(cache: &LayeredCache) {
    match cache.sweep_expired().await {
        Ok(outcome) => {
            crate::metrics::record_janitor_sweep(
                outcome.memory_removed as u64,
                outcome.durable_removed,
            );
            if outcome.memory_removed > 0 || outcome.durable_removed > 0 {
                debug!(
                    memory_removed = outcome.memory_removed,
                    durable_removed = outcome.durable_removed,
                    "janitor removed expired cache entries"
                );
            }
        }
        Err(err) => warn!(error = %err, "cache sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DurableStore, Fingerprint, PoolSettings};
    use http::Method;
    use std::num::NonZeroUsize;
    use tempfile::TempDir;

    #[tokio::test]
    async fn run_now_triggers_immediate_sweep() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let durable = DurableStore::open(
            "sqlite",
            path.to_str().unwrap(),
            &PoolSettings {
                max_open: 2,
                max_idle: 1,
                max_lifetime: Duration::from_secs(300),
                max_idle_time: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();
        let cache = Arc::new(LayeredCache::new(
            durable,
            Some(NonZeroUsize::new(8).unwrap()),
            Duration::from_secs(0),
        ));

        let fp = Fingerprint::derive(&Method::GET, "/a", b"");
        cache
            .set(&fp, b"payload".to_vec(), &Method::GET, "/a")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let janitor = Janitor::spawn(cache.clone(), Duration::from_secs(3600), shutdown_rx);
        janitor.run_now();

        let mut cleaned = false;
        for _ in 0..50 {
            if cache.stats().await.unwrap().entries == 0 {
                cleaned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cleaned, "sweep should remove the expired entry");
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let durable = DurableStore::open(
            "sqlite",
            path.to_str().unwrap(),
            &PoolSettings {
                max_open: 2,
                max_idle: 1,
                max_lifetime: Duration::from_secs(300),
                max_idle_time: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();
        let cache = Arc::new(LayeredCache::new(
            durable,
            None,
            Duration::from_secs(60),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _janitor = Janitor::spawn(cache, Duration::from_secs(3600), shutdown_rx);
        shutdown_tx.send(true).unwrap();
        // Nothing to assert beyond the send not panicking; the task exits on
        // its next poll.
    }
}
