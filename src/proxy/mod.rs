pub(crate) mod codec;
mod gzip;
mod handler;
mod listener;
pub mod pipeline;
mod respond;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::breaker::CircuitBreaker;
use crate::cache::LayeredCache;
use crate::cache::janitor::Janitor;
use crate::policy::EndpointPolicy;
use crate::ratelimit::RateLimiter;
use crate::settings::Settings;
use crate::singleflight::SingleFlight;
use crate::ssrf::SsrfValidator;
use crate::upstream::UpstreamClient;

pub(crate) use gzip::GzipWriterPool;

/// Whether the connection survives the request just served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    KeepAlive,
    Close,
}

/// Everything a request handler needs, constructed once at startup and
/// cloned (cheaply, all `Arc`s) into each connection task. There is no
/// other long-lived state.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<LayeredCache>,
    pub policy: Arc<EndpointPolicy>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub ssrf: Option<Arc<SsrfValidator>>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub client: Option<Arc<UpstreamClient>>,
    pub flight: Arc<SingleFlight<pipeline::FetchError>>,
    pub janitor: Janitor,
    pub(crate) gzip: Arc<GzipWriterPool>,
    /// Entry point with any trailing slash trimmed, ready for path concatenation.
    pub entry_point: String,
    pub tls_inbound: bool,
}

pub async fn run(app: AppContext, shutdown: watch::Receiver<bool>) -> Result<()> {
    listener::start_listener(app, shutdown).await
}
