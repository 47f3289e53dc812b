pub mod breaker;
pub mod cache;
pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod ratelimit;
pub mod settings;
pub mod singleflight;
pub mod ssrf;
pub mod upstream;
pub mod util;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;
use crate::cache::janitor::Janitor;
use crate::cache::{DurableStore, LayeredCache, PoolSettings};
use crate::policy::EndpointPolicy;
use crate::proxy::AppContext;
use crate::ratelimit::RateLimiter;
use crate::settings::Settings;
use crate::singleflight::SingleFlight;
use crate::ssrf::SsrfValidator;
use crate::upstream::{UpstreamClient, UpstreamOptions};

const SSRF_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the daemon from settings and serves until a shutdown signal.
pub async fn run(settings: Settings) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_shutdown_signal(shutdown_tx);
    run_with_shutdown(settings, shutdown_rx).await
}

/// Same as [`run`] but with an externally-owned shutdown channel; the
/// integration harness drives this directly.
pub async fn run_with_shutdown(
    settings: Settings,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let settings = Arc::new(settings);

    let pool = PoolSettings {
        max_open: settings.cache.pool.max_open,
        max_idle: settings.cache.pool.max_idle,
        max_lifetime: Duration::from_secs(settings.cache.pool.max_lifetime),
        max_idle_time: Duration::from_secs(settings.cache.pool.max_idle_time),
    };
    let durable = DurableStore::open(&settings.cache.backend, &settings.cache.path, &pool).await?;
    let memory_capacity = if settings.cache.memory.enabled {
        Some(
            NonZeroUsize::new(settings.cache.memory.capacity)
                .ok_or_else(|| anyhow!("cache.memory.capacity must be at least 1"))?,
        )
    } else {
        None
    };
    let cache = Arc::new(LayeredCache::new(
        durable,
        memory_capacity,
        settings.default_ttl(),
    ));

    let janitor = Janitor::spawn(
        cache.clone(),
        settings.cleanup_interval(),
        shutdown_rx.clone(),
    );

    let limiter = if settings.security.rate_limit.enabled {
        let limiter = Arc::new(RateLimiter::new(
            settings.security.rate_limit.per_ip,
            settings.security.rate_limit.per_key,
            settings.security.rate_limit.burst,
        ));
        limiter.spawn_sweeper(shutdown_rx.clone());
        info!(
            per_ip = settings.security.rate_limit.per_ip,
            per_key = settings.security.rate_limit.per_key,
            burst = settings.security.rate_limit.burst,
            "rate limiting enabled"
        );
        Some(limiter)
    } else {
        None
    };

    let ssrf = if settings.security.ssrf.enabled {
        info!("SSRF protection enabled");
        Some(Arc::new(SsrfValidator::new(
            &settings.security.ssrf.allowed_hosts,
            settings.security.ssrf.block_private_ips,
            SSRF_RESOLVE_TIMEOUT,
        )))
    } else {
        None
    };

    let client = match settings.upstream.caller_key.as_deref() {
        Some(key) if !key.is_empty() => {
            let options = UpstreamOptions::from_settings(&settings, key.to_string())?;
            Some(Arc::new(UpstreamClient::new(options)?))
        }
        _ => {
            warn!("no upstream caller key configured; only cached entries can be served");
            None
        }
    };

    let breaker = if settings.upstream.circuit_breaker.enabled && client.is_some() {
        info!(
            threshold = settings.upstream.circuit_breaker.threshold,
            "circuit breaker enabled"
        );
        Some(Arc::new(CircuitBreaker::new(
            settings.upstream.circuit_breaker.threshold,
            settings.breaker_open_timeout(),
            settings.upstream.circuit_breaker.half_open_max,
        )))
    } else {
        None
    };

    if settings.server.enable_http2 {
        warn!("enable_http2 is set but the inbound surface negotiates HTTP/1.1 only");
    }

    let policy = Arc::new(EndpointPolicy::new(
        &settings.policy.allowed,
        &settings.policy.offline,
    ));
    let entry_point = settings
        .upstream
        .entry_point
        .trim_end_matches('/')
        .to_string();

    let app = AppContext {
        tls_inbound: settings.server.tls_enabled,
        settings: settings.clone(),
        cache: cache.clone(),
        policy,
        limiter,
        ssrf,
        breaker,
        client,
        flight: Arc::new(SingleFlight::new()),
        janitor,
        gzip: Arc::new(proxy::GzipWriterPool::new()),
        entry_point,
    };

    let result = proxy::run(app, shutdown_rx).await;
    cache.close().await;
    result
}

fn spawn_shutdown_signal(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
