use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode};
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::breaker::BreakerState;
use crate::logging::CacheDisposition;

use super::codec::{self, BodyOutcome, RequestHead};
use super::respond::{self, ResponseSpec};
use super::{AppContext, Disposition, pipeline};

/// Operational endpoints accept at most this much request body.
const MAX_CONTROL_BODY: usize = 64 * 1024;

/// Serves one inbound connection: a keep-alive loop of parse, route,
/// respond. Malformed requests get a best-effort 400 and a close.
pub(crate) async fn serve_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    loop {
        let head = match codec::read_request_head(
            &mut reader,
            app.settings.server_idle_timeout(),
            app.settings.read_timeout(),
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                debug!(peer = %peer, error = %err, "failed to parse request");
                let spec = ResponseSpec::error(StatusCode::BAD_REQUEST, "malformed request");
                let _ = respond::write_response(
                    reader.get_mut(),
                    &spec,
                    false,
                    app.tls_inbound,
                    &app.gzip,
                    app.settings.write_timeout(),
                )
                .await;
                break;
            }
        };

        let wants_close = head.headers.wants_close();
        let disposition = route(&mut reader, head, peer, &app).await?;
        if wants_close || disposition == Disposition::Close {
            break;
        }
    }
    let _ = crate::io_util::shutdown_with_timeout(reader.get_mut(), app.settings.write_timeout())
        .await;
    Ok(())
}

async fn route<S>(
    reader: &mut BufReader<S>,
    head: RequestHead,
    peer: SocketAddr,
    app: &AppContext,
) -> Result<Disposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = head
        .target
        .split('?')
        .next()
        .unwrap_or(&head.target)
        .to_string();

    if path == "/api" || path.starts_with("/api/") {
        return pipeline::handle_proxy(reader, head, peer, app).await;
    }

    // Operational endpoints: drain any body first so keep-alive stays in
    // sync, then answer.
    let drained = codec::read_body(
        reader,
        &head.headers,
        MAX_CONTROL_BODY,
        app.settings.read_timeout(),
        false,
        "reading control request body",
    )
    .await;
    let spec = match drained {
        Ok(BodyOutcome::Complete(_)) => {
            if head.method == Method::GET && path == "/health" {
                health(app).await
            } else if head.method == Method::GET && path == "/cache/stats" {
                cache_stats(app).await
            } else if head.method == Method::POST && path == "/cache/clear" {
                cache_clear(app)
            } else if head.method == Method::GET && path == "/metrics" {
                metrics(app, &head)
            } else {
                ResponseSpec::error(StatusCode::NOT_FOUND, "not found")
            }
        }
        Ok(BodyOutcome::TooLarge) => {
            ResponseSpec::error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
        }
        Err(_) => ResponseSpec::error(StatusCode::BAD_REQUEST, "malformed request body"),
    };

    respond_logged(reader, app, &head, peer, spec).await
}

async fn respond_logged<S>(
    reader: &mut BufReader<S>,
    app: &AppContext,
    head: &RequestHead,
    peer: SocketAddr,
    spec: ResponseSpec,
) -> Result<Disposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let bytes_out = respond::write_response(
        reader.get_mut(),
        &spec,
        false,
        app.tls_inbound,
        &app.gzip,
        app.settings.write_timeout(),
    )
    .await?;
    crate::logging::log_request(
        peer.ip(),
        &head.method,
        &head.target,
        spec.status,
        CacheDisposition::None,
        0,
        bytes_out,
        start.elapsed(),
    );
    Ok(if spec.close {
        Disposition::Close
    } else {
        Disposition::KeepAlive
    })
}

/// Readiness document: durable-tier probe plus component states. Degrades
/// (503) when the database is unreachable or the breaker is open.
async fn health(app: &AppContext) -> ResponseSpec {
    let mut degraded = false;

    let database = match app.cache.ping().await {
        Ok(()) => "ok".to_string(),
        Err(err) => {
            degraded = true;
            format!("error: {err}")
        }
    };

    let mut components = serde_json::Map::new();
    if app.client.is_some() {
        let upstream_state = match &app.breaker {
            Some(breaker) if breaker.snapshot().state == BreakerState::Open => {
                degraded = true;
                "circuit_open"
            }
            _ => "ok",
        };
        components.insert("upstream_client".to_string(), json!(upstream_state));
    }
    if app.limiter.is_some() {
        components.insert("rate_limiter".to_string(), json!("ok"));
    }

    let status = if degraded { "degraded" } else { "ok" };
    let body = json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "components": components,
    });
    let http_status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    ResponseSpec::json(http_status, body.to_string().into_bytes())
}

async fn cache_stats(app: &AppContext) -> ResponseSpec {
    match app.cache.stats().await {
        Ok(stats) => match serde_json::to_vec(&stats) {
            Ok(body) => ResponseSpec::json(StatusCode::OK, body),
            Err(_) => {
                ResponseSpec::error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        },
        Err(err) => {
            debug!(error = %err, "cache stats unavailable");
            ResponseSpec::error(StatusCode::INTERNAL_SERVER_ERROR, "cache stats unavailable")
        }
    }
}

fn cache_clear(app: &AppContext) -> ResponseSpec {
    app.cache.clear_memory();
    app.janitor.run_now();
    ResponseSpec::json(StatusCode::OK, b"{\"status\":\"cleared\"}".to_vec())
}

fn metrics(app: &AppContext, head: &RequestHead) -> ResponseSpec {
    let auth = &app.settings.security.metrics_auth;
    if auth.enabled {
        let presented = bearer_token(head);
        let authorized = presented
            .map(|token| token.as_bytes().ct_eq(auth.token.as_bytes()).into())
            .unwrap_or(false);
        if !authorized {
            return ResponseSpec::error(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    ResponseSpec {
        status: StatusCode::OK,
        content_type: crate::metrics::exposition_content_type(),
        body: crate::metrics::gather(),
        extra_headers: Vec::new(),
        close: false,
    }
}

/// Token from the `authorization` header (with or without a `Bearer`
/// prefix) or the `token` query parameter.
fn bearer_token<'a>(head: &'a RequestHead) -> Option<&'a str> {
    if let Some(value) = head.headers.get("authorization") {
        return Some(value.strip_prefix("Bearer ").unwrap_or(value));
    }
    let (_, query) = head.target.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}
