use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// How a proxied request was served; carried into the access log and the
/// `x-cache` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDisposition {
    Hit,
    Miss,
    /// Operational endpoints and rejected requests never consult the cache.
    None,
}

impl CacheDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheDisposition::Hit => "HIT",
            CacheDisposition::Miss => "MISS",
            CacheDisposition::None => "-",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: IpAddr,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub cache: CacheDisposition,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        method,
        path,
        status,
        cache,
        bytes_in,
        bytes_out,
        elapsed_ms,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    tracing::info!(
        target = "access_log",
        ts,
        client_ip = %client_ip,
        method,
        path,
        status,
        cache = cache.as_str(),
        bytes_in,
        bytes_out,
        elapsed_ms,
    );

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let cache_hit = match cache {
        CacheDisposition::Hit => Some(true),
        CacheDisposition::Miss => Some(false),
        CacheDisposition::None => None,
    };
    crate::metrics::record_request(&method, status, bytes_out, cache_hit);
}

/// Convenience used by the request handler once the response is on the wire.
pub fn log_request(
    client_ip: IpAddr,
    method: &http::Method,
    path: &str,
    status: StatusCode,
    cache: CacheDisposition,
    bytes_in: u64,
    bytes_out: u64,
    elapsed: Duration,
) {
    log_access(AccessLogEvent {
        client_ip,
        method: method.to_string(),
        path: path.to_string(),
        status: status.as_u16(),
        cache,
        bytes_in,
        bytes_out,
        elapsed_ms: elapsed.as_millis(),
    });
}
