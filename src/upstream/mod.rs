use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, ensure};
use http::{Method, Uri};
use parking_lot::Mutex;
use rustls::crypto::CryptoProvider;
use rustls::crypto::ring::{self, cipher_suite};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs as native_certs;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

mod pool;

use crate::proxy::codec::{self, BodyOutcome};
use crate::settings::Settings;
use pool::{IdlePool, PooledConn, UpstreamIo};

/// Classified upstream failures; the orchestrator maps these onto response
/// status codes and never forwards the detail to clients.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("failed to connect to upstream: {0}")]
    Connect(String),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("upstream response exceeded the configured size limit")]
    TooLarge,
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    #[error("upstream i/o error: {0}")]
    Io(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub entry_point: Uri,
    pub caller_key: String,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub header_timeout: Duration,
    pub response_timeout: Duration,
    pub idle_timeout: Duration,
    pub conn_keep_alive: Duration,
    pub max_idle_per_host: usize,
    pub max_response_body: usize,
}

impl UpstreamOptions {
    pub fn from_settings(settings: &Settings, caller_key: String) -> Result<Self> {
        Ok(Self {
            entry_point: settings.entry_point_uri()?,
            caller_key,
            dial_timeout: settings.dial_timeout(),
            request_timeout: settings.request_timeout(),
            header_timeout: settings.header_timeout(),
            response_timeout: settings.response_timeout(),
            idle_timeout: settings.upstream_idle_timeout(),
            conn_keep_alive: Duration::from_secs(settings.upstream.keep_alive),
            // One upstream host, so the global idle cap and the per-host cap
            // collapse onto each other.
            max_idle_per_host: settings
                .upstream
                .max_idle_per_host
                .min(settings.upstream.max_idle),
            max_response_body: settings.security.max_response_body,
        })
    }
}

enum ExchangeFailure {
    /// The connection died before any response byte arrived; safe to retry
    /// once on a fresh connection.
    Stale,
    Fail(UpstreamError),
}

/// Long-lived HTTP/1.1 client for the single configured upstream. Every
/// request carries the caller key in `authorization` plus
/// `accept-encoding: gzip`; gzip bodies are decoded before they are
/// returned. Idle connections are reused through a bounded LIFO pool.
pub struct UpstreamClient {
    host: String,
    port: u16,
    authority: String,
    base_path: String,
    opts: UpstreamOptions,
    tls: Option<Arc<ClientConfig>>,
    pool: Mutex<IdlePool>,
}

impl UpstreamClient {
    pub fn new(opts: UpstreamOptions) -> Result<Self> {
        let scheme = opts.entry_point.scheme_str().unwrap_or_default();
        let https = scheme == "https";
        let host = opts
            .entry_point
            .host()
            .ok_or_else(|| anyhow!("upstream entry point has no host"))?
            .to_string();
        let port = opts
            .entry_point
            .port_u16()
            .unwrap_or(if https { 443 } else { 80 });
        let authority = opts
            .entry_point
            .authority()
            .map(|authority| authority.as_str().to_string())
            .unwrap_or_else(|| host.clone());
        let base_path = opts.entry_point.path().trim_end_matches('/').to_string();

        let tls = if https {
            Some(build_tls_client_config()?)
        } else {
            None
        };

        let pool = IdlePool::new(
            opts.max_idle_per_host,
            opts.idle_timeout,
            opts.conn_keep_alive,
        );

        Ok(Self {
            host,
            port,
            authority,
            base_path,
            opts,
            tls,
            pool: Mutex::new(pool),
        })
    }

    /// Issues one request and returns the decoded body bytes. The whole
    /// call is bounded by the configured request timeout.
    pub async fn request(
        &self,
        method: &Method,
        path: &str,
        body: &[u8],
        forwarded_headers: &[(String, String)],
    ) -> Result<Vec<u8>, UpstreamError> {
        match timeout(
            self.opts.request_timeout,
            self.request_inner(method, path, body, forwarded_headers),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout),
        }
    }

    async fn request_inner(
        &self,
        method: &Method,
        path: &str,
        body: &[u8],
        forwarded_headers: &[(String, String)],
    ) -> Result<Vec<u8>, UpstreamError> {
        let head = self.build_request_head(method, path, body.len(), forwarded_headers);

        let pooled_conn = self.pool.lock().take();
        if let Some(conn) = pooled_conn {
            crate::metrics::record_pool_reuse(true);
            match self.exchange(conn, &head, body).await {
                Ok(value) => return Ok(value),
                Err(ExchangeFailure::Stale) => {
                    debug!("reused upstream connection was stale; retrying on a fresh one");
                }
                Err(ExchangeFailure::Fail(err)) => return Err(err),
            }
        } else {
            crate::metrics::record_pool_reuse(false);
        }

        let conn = self.connect().await?;
        match self.exchange(conn, &head, body).await {
            Ok(value) => Ok(value),
            Err(ExchangeFailure::Stale) => Err(UpstreamError::Io(
                "upstream closed the connection before responding".to_string(),
            )),
            Err(ExchangeFailure::Fail(err)) => Err(err),
        }
    }

    fn build_request_head(
        &self,
        method: &Method,
        path: &str,
        body_len: usize,
        forwarded_headers: &[(String, String)],
    ) -> Vec<u8> {
        let target = format!("{}{}", self.base_path, path);
        let mut head = format!(
            "{method} {target} HTTP/1.1\r\nhost: {authority}\r\n",
            authority = self.authority
        );
        if !self.opts.caller_key.is_empty() {
            head.push_str(&format!("authorization: {}\r\n", self.opts.caller_key));
        }
        head.push_str("accept-encoding: gzip\r\ncontent-type: application/json\r\n");
        for (name, value) in forwarded_headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!(
            "content-length: {body_len}\r\nconnection: keep-alive\r\n\r\n"
        ));
        head.into_bytes()
    }

    async fn connect(&self) -> Result<PooledConn, UpstreamError> {
        let addrs: Vec<_> = timeout(
            self.opts.dial_timeout,
            lookup_host((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| UpstreamError::Connect(format!("DNS lookup for {} timed out", self.host)))?
        .map_err(|err| UpstreamError::Connect(format!("DNS lookup failed: {err}")))?
        .collect();

        if addrs.is_empty() {
            return Err(UpstreamError::Connect(format!(
                "no addresses for {}:{}",
                self.host, self.port
            )));
        }

        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match timeout(self.opts.dial_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(peer = %addr, error = %err, "failed to set TCP_NODELAY on upstream stream");
                    }
                    tcp = Some(stream);
                    break;
                }
                Ok(Err(err)) => last_err = Some(format!("connect to {addr} failed: {err}")),
                Err(_) => last_err = Some(format!("connect to {addr} timed out")),
            }
        }
        let tcp = tcp.ok_or_else(|| {
            UpstreamError::Connect(last_err.unwrap_or_else(|| "no usable addresses".to_string()))
        })?;

        let io = match &self.tls {
            Some(config) => {
                let server_name = ServerName::try_from(self.host.clone()).map_err(|_| {
                    UpstreamError::Connect(format!("invalid TLS server name '{}'", self.host))
                })?;
                let connector = TlsConnector::from(config.clone());
                let stream = timeout(self.opts.dial_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| {
                        UpstreamError::Connect("TLS handshake with upstream timed out".to_string())
                    })?
                    .map_err(|err| UpstreamError::Connect(format!("TLS handshake failed: {err}")))?;
                UpstreamIo::Tls(Box::new(stream))
            }
            None => UpstreamIo::Plain(tcp),
        };
        Ok(PooledConn::new(io))
    }

    async fn exchange(
        &self,
        mut conn: PooledConn,
        head: &[u8],
        body: &[u8],
    ) -> Result<Vec<u8>, ExchangeFailure> {
        {
            let stream = conn.io.get_mut();
            let write = async {
                stream.write_all(head).await?;
                if !body.is_empty() {
                    stream.write_all(body).await?;
                }
                stream.flush().await
            };
            match timeout(self.opts.header_timeout, write).await {
                Ok(Ok(())) => {}
                // A dead kept-alive connection usually surfaces right here.
                Ok(Err(_)) | Err(_) => return Err(ExchangeFailure::Stale),
            }
        }

        let mut status_line = String::new();
        let read = codec::read_line_limited(
            &mut conn.io,
            &mut status_line,
            self.opts.header_timeout,
            codec::MAX_HEADER_BYTES,
            "reading upstream status line",
        )
        .await
        .map_err(|err| map_read_error(err, "upstream status line"))?;
        if read == 0 {
            return Err(ExchangeFailure::Stale);
        }
        let status = parse_status_line(&status_line).map_err(ExchangeFailure::Fail)?;

        let headers = codec::read_header_block(
            &mut conn.io,
            self.opts.header_timeout,
            codec::MAX_HEADER_BYTES,
            "reading upstream response headers",
        )
        .await
        .map_err(|err| map_read_error(err, "upstream response headers"))?;

        let outcome = codec::read_body(
            &mut conn.io,
            &headers,
            self.opts.max_response_body,
            self.opts.response_timeout,
            true,
            "reading upstream response body",
        )
        .await
        .map_err(|err| map_read_error(err, "upstream response body"))?;
        let raw = match outcome {
            BodyOutcome::Complete(bytes) => bytes,
            BodyOutcome::TooLarge => return Err(ExchangeFailure::Fail(UpstreamError::TooLarge)),
        };

        // Only explicitly framed responses leave the connection in a
        // reusable state; EOF-delimited bodies consumed it.
        let framed = headers.is_chunked() || headers.content_length().ok().flatten().is_some();
        if framed && !headers.wants_close() {
            self.pool.lock().put(conn);
        }

        if status >= 400 {
            return Err(ExchangeFailure::Fail(UpstreamError::Status(status)));
        }

        let gzipped = headers
            .get("content-encoding")
            .map(|value| value.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        if gzipped {
            self.gunzip(&raw).map_err(ExchangeFailure::Fail)
        } else {
            Ok(raw)
        }
    }

    fn gunzip(&self, data: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read = decoder
                .read(&mut chunk)
                .map_err(|err| UpstreamError::Protocol(format!("invalid gzip body: {err}")))?;
            if read == 0 {
                break;
            }
            if out.len() + read > self.opts.max_response_body {
                return Err(UpstreamError::TooLarge);
            }
            out.extend_from_slice(&chunk[..read]);
        }
        Ok(out)
    }
}

fn parse_status_line(line: &str) -> Result<u16, UpstreamError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(UpstreamError::Protocol(format!(
            "unexpected status line '{trimmed}'"
        )));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..=599).contains(code))
        .ok_or_else(|| UpstreamError::Protocol(format!("unexpected status line '{trimmed}'")))
}

fn map_read_error(err: anyhow::Error, what: &str) -> ExchangeFailure {
    let message = err.to_string();
    if message.contains("timed out") {
        ExchangeFailure::Fail(UpstreamError::Timeout)
    } else {
        ExchangeFailure::Fail(UpstreamError::Protocol(format!("{what}: {message}")))
    }
}

fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let suites = vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ];
    let provider = CryptoProvider {
        cipher_suites: suites,
        ..ring::default_provider()
    };
    let builder = ClientConfig::builder_with_provider(provider.into())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .context("failed to configure TLS protocol versions")?;

    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }
    ensure!(
        anchors_loaded > 0,
        "no trust anchors available; install system certificates"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
