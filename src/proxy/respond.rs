use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;

use super::gzip::{GzipWriterPool, MIN_COMPRESS_BYTES};

/// A fully-materialized response ready for the wire.
pub(crate) struct ResponseSpec {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    /// Proxy-added headers such as `x-cache` and `x-offline`.
    pub extra_headers: Vec<(&'static str, String)>,
    pub close: bool,
}

impl ResponseSpec {
    pub(crate) fn json(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.into(),
            extra_headers: Vec::new(),
            close: false,
        }
    }

    pub(crate) fn error(status: StatusCode, message: &str) -> Self {
        let mut spec = Self::json(status, format!("{{\"error\":\"{message}\"}}"));
        spec.close = true;
        spec
    }

    pub(crate) fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }

    pub(crate) fn closing(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Writes the response with the mandatory security headers, compressing the
/// body through the shared gzip pool when the client accepts it and the
/// payload is large enough. Returns the body bytes put on the wire.
pub(crate) async fn write_response<S>(
    stream: &mut S,
    spec: &ResponseSpec,
    accept_gzip: bool,
    tls: bool,
    gzip_pool: &GzipWriterPool,
    write_timeout: Duration,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let compressed = if accept_gzip && spec.body.len() > MIN_COMPRESS_BYTES {
        Some(gzip_pool.compress(&spec.body)?)
    } else {
        None
    };
    let payload: &[u8] = compressed
        .as_ref()
        .map(|gz| gz.bytes())
        .unwrap_or(&spec.body);

    let reason = spec.status.canonical_reason().unwrap_or("Unknown");
    let mut head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: {}\r\ncontent-length: {}\r\n",
        spec.status.as_u16(),
        reason,
        spec.content_type,
        payload.len()
    );
    if compressed.is_some() {
        head.push_str("content-encoding: gzip\r\nvary: accept-encoding\r\n");
    }
    for (name, value) in &spec.extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("x-frame-options: DENY\r\n");
    head.push_str("x-content-type-options: nosniff\r\n");
    head.push_str("x-xss-protection: 1; mode=block\r\n");
    head.push_str("content-security-policy: default-src 'self'\r\n");
    head.push_str("referrer-policy: strict-origin-when-cross-origin\r\n");
    if tls {
        head.push_str("strict-transport-security: max-age=31536000; includeSubDomains\r\n");
    }
    head.push_str(if spec.close {
        "connection: close\r\n\r\n"
    } else {
        "connection: keep-alive\r\n\r\n"
    });

    write_all_with_timeout(stream, head.as_bytes(), write_timeout, "writing response head").await?;
    if !payload.is_empty() {
        write_all_with_timeout(stream, payload, write_timeout, "writing response body").await?;
    }
    stream.flush().await?;
    Ok(payload.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tokio::io::AsyncReadExt;

    async fn written(spec: &ResponseSpec, accept_gzip: bool, tls: bool) -> Vec<u8> {
        let (mut tx, mut rx) = tokio::io::duplex(256 * 1024);
        let pool = GzipWriterPool::new();
        write_response(
            &mut tx,
            spec,
            accept_gzip,
            tls,
            &pool,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        drop(tx);
        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn sets_security_headers() {
        let spec = ResponseSpec::json(StatusCode::OK, b"{}".to_vec());
        let out = written(&spec, false, false).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("x-frame-options: DENY"));
        assert!(text.contains("x-content-type-options: nosniff"));
        assert!(text.contains("x-xss-protection: 1; mode=block"));
        assert!(text.contains("content-security-policy: default-src 'self'"));
        assert!(text.contains("referrer-policy: strict-origin-when-cross-origin"));
        assert!(!text.contains("strict-transport-security"));
    }

    #[tokio::test]
    async fn hsts_only_over_tls() {
        let spec = ResponseSpec::json(StatusCode::OK, b"{}".to_vec());
        let out = written(&spec, false, true).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("strict-transport-security: max-age=31536000; includeSubDomains"));
    }

    #[tokio::test]
    async fn small_bodies_are_not_compressed() {
        let spec = ResponseSpec::json(StatusCode::OK, b"{\"small\":true}".to_vec());
        let out = written(&spec, true, false).await;
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("content-encoding"));
        assert!(text.ends_with("{\"small\":true}"));
    }

    #[tokio::test]
    async fn large_bodies_compress_when_accepted() {
        let body = b"a".repeat(4096);
        let spec = ResponseSpec::json(StatusCode::OK, body.clone());
        let out = written(&spec, true, false).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("content-encoding: gzip"));
        assert!(text.contains("vary: accept-encoding"));

        let body_start = out
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .unwrap()
            + 4;
        let mut decoder = flate2::read::GzDecoder::new(&out[body_start..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn large_bodies_stay_plain_without_accept_encoding() {
        let body = b"a".repeat(4096);
        let spec = ResponseSpec::json(StatusCode::OK, body.clone());
        let out = written(&spec, false, false).await;
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("content-encoding"));
    }

    #[tokio::test]
    async fn proxy_headers_are_emitted() {
        let spec = ResponseSpec::json(StatusCode::OK, b"{}".to_vec())
            .with_header("x-cache", "HIT")
            .with_header("x-offline", "true");
        let out = written(&spec, false, false).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("x-cache: HIT"));
        assert!(text.contains("x-offline: true"));
    }
}
