use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode, Uri};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::cache::{Fingerprint, LayeredCache};
use crate::logging::CacheDisposition;
use crate::singleflight::FlightError;
use crate::upstream::{UpstreamClient, UpstreamError};

use super::codec::{self, BodyOutcome, HeaderBlock, RequestHead};
use super::respond::ResponseSpec;
use super::{AppContext, Disposition};

/// Headers that are never forwarded upstream: hop-by-hop headers, framing
/// headers the transport rewrites, and the proxy's own admission headers.
const SKIP_FORWARD: &[&str] = &[
    "host",
    "authorization",
    "accept-encoding",
    "content-length",
    "content-type",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "te",
    "upgrade",
    "proxy-connection",
    "expect",
    "x-api-key",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-real-ip",
];

/// Failure of the whole miss-fill step, after the circuit breaker has had
/// its say.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream circuit open")]
    CircuitOpen,
    #[error(transparent)]
    Upstream(UpstreamError),
}

struct RequestScope {
    method: Method,
    path: String,
    client_ip: IpAddr,
    accept_gzip: bool,
    bytes_in: u64,
    start: Instant,
}

/// The proxy path: admission, body cap, policy, fingerprint, cache read,
/// offline handling, SSRF validation, coalesced upstream fill, cache write,
/// response.
pub(crate) async fn handle_proxy<S>(
    reader: &mut BufReader<S>,
    head: RequestHead,
    peer: SocketAddr,
    app: &AppContext,
) -> Result<Disposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let RequestHead {
        method,
        target,
        headers,
    } = head;

    let path = target.split('?').next().unwrap_or(&target).to_string();
    let mut scope = RequestScope {
        client_ip: client_ip(&headers, peer),
        accept_gzip: accepts_gzip(&headers),
        bytes_in: 0,
        start: Instant::now(),
        method,
        path,
    };

    // Admission: IP bucket first, caller-key bucket second.
    let caller_key = headers.get("x-api-key").map(|value| value.to_string());
    if let Some(limiter) = &app.limiter {
        if !limiter.allow_ip(scope.client_ip) {
            crate::metrics::record_rate_limit_rejection("ip");
            let spec = ResponseSpec::error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            return finish(reader, app, &scope, spec, CacheDisposition::None).await;
        }
        if let Some(key) = &caller_key
            && !limiter.allow_key(key)
        {
            crate::metrics::record_rate_limit_rejection("key");
            let spec = ResponseSpec::error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            return finish(reader, app, &scope, spec, CacheDisposition::None).await;
        }
    }

    // Bodied methods must carry JSON (or nothing).
    if scope.method == Method::POST || scope.method == Method::PUT {
        let content_type = headers.get("content-type").unwrap_or_default();
        if !content_type.is_empty() && !content_type.contains("application/json") {
            let spec = ResponseSpec::error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "content-type must be application/json",
            );
            return finish(reader, app, &scope, spec, CacheDisposition::None).await;
        }
    }

    // Body read with the configured cap; an oversized body is rejected
    // without draining the rest.
    let body = match codec::read_body(
        reader,
        &headers,
        app.settings.security.max_request_body,
        app.settings.read_timeout(),
        false,
        "reading request body",
    )
    .await
    {
        Ok(BodyOutcome::Complete(body)) => body,
        Ok(BodyOutcome::TooLarge) => {
            let spec = ResponseSpec::error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large",
            );
            return finish(reader, app, &scope, spec, CacheDisposition::None).await;
        }
        Err(err) => {
            debug!(peer = %peer, error = %err, "malformed request body");
            let spec = ResponseSpec::error(StatusCode::BAD_REQUEST, "malformed request body");
            return finish(reader, app, &scope, spec, CacheDisposition::None).await;
        }
    };
    scope.bytes_in = body.len() as u64;

    // Policy gate on the endpoint path (the `/api` prefix is already gone).
    let endpoint = scope
        .path
        .strip_prefix("/api")
        .unwrap_or(&scope.path)
        .to_string();
    if !app.policy.is_allowed(&endpoint) {
        let spec = ResponseSpec::error(StatusCode::FORBIDDEN, "endpoint not allowed");
        return finish(reader, app, &scope, spec, CacheDisposition::None).await;
    }
    let is_offline = app.policy.is_offline(&endpoint);

    let fp = Fingerprint::derive(&scope.method, &endpoint, &body);

    // Cache read; a hit ends the request here.
    if let Some(value) = app.cache.get(&fp).await {
        if value.len() > app.settings.security.max_response_body {
            let spec = ResponseSpec::error(StatusCode::INTERNAL_SERVER_ERROR, "response too large");
            return finish(reader, app, &scope, spec, CacheDisposition::None).await;
        }
        let mut spec =
            ResponseSpec::json(StatusCode::OK, value).with_header("x-cache", "HIT");
        if is_offline {
            spec = spec.with_header("x-offline", "true");
        }
        return finish(reader, app, &scope, spec, CacheDisposition::Hit).await;
    }

    // Offline endpoints never go upstream.
    if is_offline {
        let spec = ResponseSpec::error(
            StatusCode::SERVICE_UNAVAILABLE,
            "offline endpoint not available in cache",
        );
        return finish(reader, app, &scope, spec, CacheDisposition::Miss).await;
    }

    let Some(client) = &app.client else {
        let spec = ResponseSpec::error(StatusCode::UNAUTHORIZED, "not authenticated");
        return finish(reader, app, &scope, spec, CacheDisposition::Miss).await;
    };

    // SSRF validation of the computed upstream URL.
    if let Some(ssrf) = &app.ssrf {
        let upstream_url = format!("{}{}", app.entry_point, endpoint);
        match upstream_url.parse::<Uri>() {
            Ok(uri) => {
                if let Err(err) = ssrf.validate(&uri).await {
                    warn!(url = %upstream_url, error = %err, "SSRF validation rejected upstream URL");
                    let spec =
                        ResponseSpec::error(StatusCode::FORBIDDEN, "invalid upstream URL");
                    return finish(reader, app, &scope, spec, CacheDisposition::Miss).await;
                }
            }
            Err(err) => {
                warn!(url = %upstream_url, error = %err, "computed upstream URL does not parse");
                let spec = ResponseSpec::error(StatusCode::FORBIDDEN, "invalid upstream URL");
                return finish(reader, app, &scope, spec, CacheDisposition::Miss).await;
            }
        }
    }

    // Miss fill: breaker-gated transport call plus the cache write, run
    // under single-flight so concurrent identical misses share one call.
    let forwarded = forwarded_headers(&headers);
    let fetch = miss_fill(
        client.clone(),
        app.breaker.clone(),
        app.cache.clone(),
        fp,
        scope.method.clone(),
        endpoint.clone(),
        body,
        forwarded,
    );

    let outcome = if app.settings.upstream.deduplication_enabled {
        app.flight.run(&fp.to_hex(), fetch).await
    } else {
        fetch.await.map_err(|err| FlightError::Call(Arc::new(err)))
    };

    match outcome {
        Ok(value) => {
            if value.len() > app.settings.security.max_response_body {
                let spec =
                    ResponseSpec::error(StatusCode::INTERNAL_SERVER_ERROR, "response too large");
                return finish(reader, app, &scope, spec, CacheDisposition::Miss).await;
            }
            let spec = ResponseSpec::json(StatusCode::OK, value).with_header("x-cache", "MISS");
            finish(reader, app, &scope, spec, CacheDisposition::Miss).await
        }
        Err(FlightError::Call(err)) => {
            let spec = fetch_error_response(&err).with_header("x-cache", "MISS");
            finish(reader, app, &scope, spec, CacheDisposition::Miss).await
        }
        Err(FlightError::Aborted) => {
            let spec = ResponseSpec::error(StatusCode::BAD_GATEWAY, "upstream service unavailable")
                .with_header("x-cache", "MISS");
            finish(reader, app, &scope, spec, CacheDisposition::Miss).await
        }
    }
}

/// The leader body for a cache miss: call upstream through the breaker and
/// write the result through the layered cache. Cache-write failures are
/// logged and the response still succeeds.
#[allow(clippy::too_many_arguments)]
fn miss_fill(
    client: Arc<UpstreamClient>,
    breaker: Option<Arc<CircuitBreaker>>,
    cache: Arc<LayeredCache>,
    fp: Fingerprint,
    method: Method,
    endpoint: String,
    body: Vec<u8>,
    forwarded: Vec<(String, String)>,
) -> impl std::future::Future<Output = Result<Vec<u8>, FetchError>> + Send + 'static {
    async move {
        let value = match &breaker {
            Some(breaker) => breaker
                .call(|| client.request(&method, &endpoint, &body, &forwarded))
                .await
                .map_err(|err| match err {
                    BreakerError::Open => FetchError::CircuitOpen,
                    BreakerError::Inner(inner) => FetchError::Upstream(inner),
                })?,
            None => client
                .request(&method, &endpoint, &body, &forwarded)
                .await
                .map_err(FetchError::Upstream)?,
        };

        if let Err(err) = cache.set(&fp, value.clone(), &method, &endpoint).await {
            warn!(
                error = %err,
                endpoint = %endpoint,
                "failed to cache upstream response"
            );
        }
        Ok(value)
    }
}

fn fetch_error_response(err: &FetchError) -> ResponseSpec {
    match err {
        FetchError::Upstream(UpstreamError::TooLarge) => {
            ResponseSpec::error(StatusCode::INTERNAL_SERVER_ERROR, "response too large")
        }
        FetchError::CircuitOpen | FetchError::Upstream(_) => {
            ResponseSpec::error(StatusCode::BAD_GATEWAY, "upstream service unavailable")
        }
    }
}

async fn finish<S>(
    reader: &mut BufReader<S>,
    app: &AppContext,
    scope: &RequestScope,
    spec: ResponseSpec,
    cache: CacheDisposition,
) -> Result<Disposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes_out = super::respond::write_response(
        reader.get_mut(),
        &spec,
        scope.accept_gzip,
        app.tls_inbound,
        &app.gzip,
        app.settings.write_timeout(),
    )
    .await?;
    crate::logging::log_request(
        scope.client_ip,
        &scope.method,
        &scope.path,
        spec.status,
        cache,
        scope.bytes_in,
        bytes_out,
        scope.start.elapsed(),
    );
    Ok(if spec.close {
        Disposition::Close
    } else {
        Disposition::KeepAlive
    })
}

fn client_ip(headers: &HeaderBlock, peer: SocketAddr) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        let first = forwarded.split(',').next().unwrap_or_default().trim();
        if let Ok(ip) = first.parse() {
            return ip;
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(ip) = real_ip.trim().parse()
    {
        return ip;
    }
    peer.ip()
}

fn accepts_gzip(headers: &HeaderBlock) -> bool {
    headers
        .get("accept-encoding")
        .map(|value| value.contains("gzip"))
        .unwrap_or(false)
}

fn forwarded_headers(headers: &HeaderBlock) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !SKIP_FORWARD.contains(name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
