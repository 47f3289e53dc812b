use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Buckets that see no traffic for this long are dropped by the sweep task.
const BUCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Token-bucket admission keyed by client IP and by caller key. Bucket
/// creation happens lazily under the table lock; the refill-and-consume
/// update runs under the bucket's own lock so unrelated clients never
/// contend.
pub struct RateLimiter {
    ip_buckets: Mutex<HashMap<IpAddr, Arc<Mutex<TokenBucket>>>>,
    key_buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    ip_rate: f64,
    key_rate: f64,
    burst: f64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_second: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            capacity: burst,
            refill_rate: rate_per_second,
            last_refill: Instant::now(),
        }
    }

    /// Continuous refill: credit `elapsed * rate` tokens capped at capacity,
    /// then consume one if available.
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl RateLimiter {
    /// Rates are configured per minute, matching the configuration surface.
    pub fn new(ip_per_minute: u32, key_per_minute: u32, burst: u32) -> Self {
        Self {
            ip_buckets: Mutex::new(HashMap::new()),
            key_buckets: Mutex::new(HashMap::new()),
            ip_rate: f64::from(ip_per_minute) / 60.0,
            key_rate: f64::from(key_per_minute) / 60.0,
            burst: f64::from(burst),
        }
    }

    pub fn allow_ip(&self, ip: IpAddr) -> bool {
        let bucket = {
            let mut table = self.ip_buckets.lock();
            table
                .entry(ip)
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(self.ip_rate, self.burst))))
                .clone()
        };
        bucket.lock().allow()
    }

    pub fn allow_key(&self, key: &str) -> bool {
        let bucket = {
            let mut table = self.key_buckets.lock();
            match table.get(key) {
                Some(bucket) => bucket.clone(),
                None => {
                    let bucket =
                        Arc::new(Mutex::new(TokenBucket::new(self.key_rate, self.burst)));
                    table.insert(key.to_string(), bucket.clone());
                    bucket
                }
            }
        };
        bucket.lock().allow()
    }

    /// Spawns the idle-bucket sweeper. A dedicated task is simpler and safer
    /// than opportunistic eviction inside `allow`.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.evict_idle(BUCKET_IDLE_TIMEOUT),
                    _ = shutdown.changed() => {
                        debug!("rate limiter sweeper stopping");
                        break;
                    }
                }
            }
        });
    }

    fn evict_idle(&self, idle_timeout: Duration) {
        let now = Instant::now();
        let stale =
            |bucket: &Arc<Mutex<TokenBucket>>| now - bucket.lock().last_refill >= idle_timeout;

        let mut removed = 0usize;
        {
            let mut table = self.ip_buckets.lock();
            let before = table.len();
            table.retain(|_, bucket| !stale(bucket));
            removed += before - table.len();
        }
        {
            let mut table = self.key_buckets.lock();
            let before = table.len();
            table.retain(|_, bucket| !stale(bucket));
            removed += before - table.len();
        }
        if removed > 0 {
            debug!(removed, "evicted idle rate-limit buckets");
        }
    }

    #[cfg(test)]
    fn bucket_counts(&self) -> (usize, usize) {
        (self.ip_buckets.lock().len(), self.key_buckets.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn burst_is_honored_then_denied() {
        let limiter = RateLimiter::new(60, 60, 10);
        for _ in 0..10 {
            assert!(limiter.allow_ip(ip(1)));
        }
        assert!(!limiter.allow_ip(ip(1)));
    }

    #[test]
    fn refill_admits_after_waiting() {
        let limiter = RateLimiter::new(6000, 6000, 1);
        assert!(limiter.allow_ip(ip(2)));
        assert!(!limiter.allow_ip(ip(2)));
        // 100 tokens/second; 50ms is enough for several tokens but the
        // bucket caps at capacity 1.
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.allow_ip(ip(2)));
        assert!(!limiter.allow_ip(ip(2)));
    }

    #[test]
    fn ip_buckets_are_independent() {
        let limiter = RateLimiter::new(60, 60, 1);
        assert!(limiter.allow_ip(ip(3)));
        assert!(!limiter.allow_ip(ip(3)));
        assert!(limiter.allow_ip(ip(4)));
    }

    #[test]
    fn key_buckets_are_independent_of_ip_buckets() {
        let limiter = RateLimiter::new(60, 60, 1);
        assert!(limiter.allow_ip(ip(5)));
        assert!(limiter.allow_key("caller-a"));
        assert!(!limiter.allow_key("caller-a"));
        assert!(limiter.allow_key("caller-b"));
    }

    #[test]
    fn idle_buckets_are_evicted() {
        let limiter = RateLimiter::new(60, 60, 1);
        limiter.allow_ip(ip(6));
        limiter.allow_key("caller-a");
        assert_eq!(limiter.bucket_counts(), (1, 1));

        limiter.evict_idle(Duration::from_millis(0));
        assert_eq!(limiter.bucket_counts(), (0, 0));
    }

    #[test]
    fn active_buckets_survive_eviction() {
        let limiter = RateLimiter::new(60, 60, 5);
        limiter.allow_ip(ip(7));
        limiter.evict_idle(Duration::from_secs(600));
        assert_eq!(limiter.bucket_counts(), (1, 0));
    }
}
