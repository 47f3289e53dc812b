use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("requests_total", "Total proxied requests").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register requests_total");
    counter
});

static CACHE_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_hits_total", "Requests served from cache").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_hits_total");
    counter
});

static CACHE_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_misses_total", "Requests that missed the cache")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_misses_total");
    counter
});

static BYTES_TRANSFERRED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "bytes_transferred_total",
        "Response body bytes written to clients",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register bytes_transferred_total");
    counter
});

static ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("errors_total", "Requests that ended in an error").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register errors_total");
    counter
});

static REQUESTS_BY_METHOD: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_by_method", "Requests by HTTP method");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_by_method");
    vec
});

static REQUESTS_BY_STATUS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_by_status", "Requests by response status");
    let vec = IntCounterVec::new(opts, &["status"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_by_status");
    vec
});

static RATE_LIMIT_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "rate_limit_rejections_total",
        "Requests rejected by the rate limiter",
    );
    let vec = IntCounterVec::new(opts, &["scope"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register rate_limit_rejections_total");
    vec
});

static BREAKER_OPEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "circuit_breaker_open_total",
        "Circuit breaker transitions into the open state",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register circuit_breaker_open_total");
    counter
});

static BREAKER_REJECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "circuit_breaker_rejections_total",
        "Calls rejected while the circuit breaker was open",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register circuit_breaker_rejections_total");
    counter
});

static UPSTREAM_POOL_REUSE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new(
            "upstream_pool_reuse_total",
            "Upstream connection reuse counts",
        ),
        &["reused"],
    )
    .expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_pool_reuse_total");
    vec
});

static JANITOR_SWEEPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("janitor_sweeps_total", "Cache janitor runs").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register janitor_sweeps_total");
    counter
});

static JANITOR_REMOVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new(
            "janitor_removed_entries_total",
            "Expired entries removed by the janitor",
        ),
        &["tier"],
    )
    .expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register janitor_removed_entries_total");
    vec
});

pub fn record_request(method: &str, status: StatusCode, bytes_out: u64, cache_hit: Option<bool>) {
    REQUESTS_TOTAL.inc();
    REQUESTS_BY_METHOD.with_label_values(&[method]).inc();
    REQUESTS_BY_STATUS
        .with_label_values(&[status.as_str()])
        .inc();
    if bytes_out > 0 {
        BYTES_TRANSFERRED_TOTAL.inc_by(bytes_out);
    }
    match cache_hit {
        Some(true) => CACHE_HITS_TOTAL.inc(),
        Some(false) => CACHE_MISSES_TOTAL.inc(),
        None => {}
    }
    if status.is_client_error() || status.is_server_error() {
        ERRORS_TOTAL.inc();
    }
}

pub fn record_rate_limit_rejection(scope: &'static str) {
    RATE_LIMIT_REJECTIONS_TOTAL
        .with_label_values(&[scope])
        .inc();
}

pub fn record_breaker_open() {
    BREAKER_OPEN_TOTAL.inc();
}

pub fn record_breaker_rejection() {
    BREAKER_REJECTIONS_TOTAL.inc();
}

pub fn record_pool_reuse(reused: bool) {
    let label = if reused { "yes" } else { "no" };
    UPSTREAM_POOL_REUSE_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_janitor_sweep(memory_removed: u64, durable_removed: u64) {
    JANITOR_SWEEPS_TOTAL.inc();
    if memory_removed > 0 {
        JANITOR_REMOVED_TOTAL
            .with_label_values(&["memory"])
            .inc_by(memory_removed);
    }
    if durable_removed > 0 {
        JANITOR_REMOVED_TOTAL
            .with_label_values(&["durable"])
            .inc_by(durable_removed);
    }
}

/// Prometheus text-format exposition for `GET /metrics`.
pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

pub fn exposition_content_type() -> &'static str {
    // Must match prometheus::TEXT_FORMAT.
    "text/plain; version=0.0.4"
}
