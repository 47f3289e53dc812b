use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::util::timeout_with_context;

pub(crate) const MAX_HEADER_BYTES: usize = 32 * 1024;

/// Reads one CRLF-terminated line under a byte limit and a timeout. Returns
/// zero when the stream ends before any byte arrives.
pub(crate) async fn read_line_limited<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    max_len: usize,
    context: &str,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = timeout_with_context(timeout_dur, reader.fill_buf(), context).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow while {context}"))?
            > max_len
        {
            bail!("line exceeds configured limit of {max_len} bytes while {context}");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string =
        String::from_utf8(collected).map_err(|_| anyhow!("invalid bytes while {context}"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

/// Accumulated header block with the handful of framing views this proxy
/// needs. Names are kept lowercased; values trimmed.
#[derive(Debug, Default)]
pub(crate) struct HeaderBlock {
    lines: Vec<(String, String)>,
    total_bytes: usize,
}

impl HeaderBlock {
    pub(crate) fn push_line(&mut self, line: &str) -> Result<bool> {
        let line_len = line.len();
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            self.total_bytes += line_len;
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        ensure!(!name.is_empty(), "header name must not be empty");
        http::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        self.total_bytes += line_len;
        self.lines
            .push((name.to_ascii_lowercase(), value.to_string()));
        Ok(true)
    }

    pub(crate) fn get(&self, lower_name: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|(name, _)| name == lower_name)
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn content_length(&self) -> Result<Option<usize>> {
        let mut found: Option<usize> = None;
        for (name, value) in &self.lines {
            if name != "content-length" {
                continue;
            }
            let parsed: usize = value
                .parse()
                .with_context(|| format!("invalid content-length '{value}'"))?;
            if let Some(existing) = found
                && existing != parsed
            {
                bail!("conflicting content-length headers");
            }
            found = Some(parsed);
        }
        Ok(found)
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.get("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
            })
            .unwrap_or(false)
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

/// Reads header lines up to the empty separator line.
pub(crate) async fn read_header_block<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    max_bytes: usize,
    context: &str,
) -> Result<HeaderBlock>
where
    S: AsyncRead + Unpin,
{
    let mut headers = HeaderBlock::default();
    let mut line = String::new();
    loop {
        let remaining = max_bytes
            .checked_sub(headers.total_bytes())
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("headers exceed configured limit while {context}"))?;
        let read = read_line_limited(reader, &mut line, timeout_dur, remaining, context).await?;
        if read == 0 {
            bail!("connection closed while {context}");
        }
        if !headers
            .push_line(&line)
            .with_context(|| format!("invalid header while {context}"))?
        {
            break;
        }
    }
    Ok(headers)
}

/// Parsed head of an inbound request.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderBlock,
}

/// Reads an HTTP/1.1 request head. Returns `None` when the connection closes
/// (or stays idle past `idle_timeout`) before a request line arrives, which
/// ends a keep-alive loop cleanly.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    idle_timeout: Duration,
    header_timeout: Duration,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    // Wait out the keep-alive gap first; a quiet expiry of the idle window
    // (or a clean close) ends the connection without an error.
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).context("waiting for request data");
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let mut request_line = String::new();
    let read = read_line_limited(
        reader,
        &mut request_line,
        header_timeout,
        MAX_HEADER_BYTES,
        "reading request line",
    )
    .await?;
    if read == 0 {
        return Ok(None);
    }

    let line = request_line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let remaining = MAX_HEADER_BYTES
        .checked_sub(request_line.len())
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    let headers = read_header_block(
        reader,
        header_timeout,
        remaining,
        "reading request headers",
    )
    .await?;

    Ok(Some(RequestHead {
        method,
        target: target.to_string(),
        headers,
    }))
}

/// Body read outcome: `TooLarge` is reported without draining the remainder
/// so callers can reject oversized payloads immediately.
#[derive(Debug)]
pub(crate) enum BodyOutcome {
    Complete(Vec<u8>),
    TooLarge,
}

/// Reads a message body framed by the given headers: content-length,
/// chunked, or (when `allow_eof` is set, for responses) until EOF.
pub(crate) async fn read_body<S>(
    reader: &mut BufReader<S>,
    headers: &HeaderBlock,
    cap: usize,
    timeout_dur: Duration,
    allow_eof: bool,
    context: &str,
) -> Result<BodyOutcome>
where
    S: AsyncRead + Unpin,
{
    if headers.is_chunked() {
        return read_chunked_body(reader, cap, timeout_dur, context).await;
    }

    match headers.content_length()? {
        Some(length) => {
            if length > cap {
                return Ok(BodyOutcome::TooLarge);
            }
            let mut body = vec![0u8; length];
            timeout_with_context(timeout_dur, reader.read_exact(&mut body), context).await?;
            Ok(BodyOutcome::Complete(body))
        }
        None if allow_eof => {
            let mut body = Vec::new();
            let mut chunk = [0u8; 8 * 1024];
            loop {
                let read = timeout_with_context(timeout_dur, reader.read(&mut chunk), context).await?;
                if read == 0 {
                    return Ok(BodyOutcome::Complete(body));
                }
                if body.len() + read > cap {
                    return Ok(BodyOutcome::TooLarge);
                }
                body.extend_from_slice(&chunk[..read]);
            }
        }
        None => Ok(BodyOutcome::Complete(Vec::new())),
    }
}

async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    cap: usize,
    timeout_dur: Duration,
    context: &str,
) -> Result<BodyOutcome>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        let read = read_line_limited(reader, &mut line, timeout_dur, 1024, context).await?;
        ensure!(read > 0, "connection closed mid chunked body while {context}");
        let size_token = line
            .trim_end_matches(['\r', '\n'])
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        let size = usize::from_str_radix(size_token, 16)
            .with_context(|| format!("invalid chunk size '{size_token}' while {context}"))?;

        if size == 0 {
            // Trailer section: consume lines until the terminating blank one.
            loop {
                let read = read_line_limited(reader, &mut line, timeout_dur, 1024, context).await?;
                ensure!(read > 0, "connection closed in chunk trailers while {context}");
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            return Ok(BodyOutcome::Complete(body));
        }

        if body.len() + size > cap {
            return Ok(BodyOutcome::TooLarge);
        }
        let start = body.len();
        body.resize(start + size, 0);
        timeout_with_context(timeout_dur, reader.read_exact(&mut body[start..]), context).await?;

        let mut crlf = [0u8; 2];
        timeout_with_context(timeout_dur, reader.read_exact(&mut crlf), context).await?;
        ensure!(&crlf == b"\r\n", "malformed chunk terminator while {context}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn reader_for(data: &[u8]) -> BufReader<tokio::io::DuplexStream> {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(data).await.unwrap();
        drop(tx);
        BufReader::new(rx)
    }

    #[tokio::test]
    async fn parses_request_head() {
        let mut reader =
            reader_for(b"GET /api/v1/x HTTP/1.1\r\nHost: localhost\r\nX-Api-Key: k\r\n\r\n").await;
        let head = read_request_head(&mut reader, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/api/v1/x");
        assert_eq!(head.headers.get("x-api-key"), Some("k"));
    }

    #[tokio::test]
    async fn closed_connection_yields_none() {
        let mut reader = reader_for(b"").await;
        let head = read_request_head(&mut reader, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn rejects_http10() {
        let mut reader = reader_for(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").await;
        let err = read_request_head(&mut reader, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP/1.0"));
    }

    #[tokio::test]
    async fn rejects_extra_request_line_tokens() {
        let mut reader = reader_for(b"GET / HTTP/1.1 junk\r\n\r\n").await;
        let err = read_request_head(&mut reader, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unexpected data"));
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let mut reader = reader_for(b"hello").await;
        let mut headers = HeaderBlock::default();
        headers.push_line("Content-Length: 5\r\n").unwrap();
        let body = read_body(
            &mut reader,
            &headers,
            1024,
            Duration::from_secs(1),
            false,
            "reading test body",
        )
        .await
        .unwrap();
        match body {
            BodyOutcome::Complete(bytes) => assert_eq!(bytes, b"hello"),
            BodyOutcome::TooLarge => panic!("unexpected TooLarge"),
        }
    }

    #[tokio::test]
    async fn body_over_cap_is_rejected_without_reading() {
        let mut reader = reader_for(b"too much data").await;
        let mut headers = HeaderBlock::default();
        headers.push_line("Content-Length: 1001\r\n").unwrap();
        let body = read_body(
            &mut reader,
            &headers,
            1000,
            Duration::from_secs(1),
            false,
            "reading test body",
        )
        .await
        .unwrap();
        assert!(matches!(body, BodyOutcome::TooLarge));
    }

    #[tokio::test]
    async fn body_exactly_at_cap_is_accepted() {
        let payload = vec![b'x'; 1000];
        let mut framed = Vec::new();
        framed.extend_from_slice(&payload);
        let mut reader = reader_for(&framed).await;
        let mut headers = HeaderBlock::default();
        headers.push_line("Content-Length: 1000\r\n").unwrap();
        let body = read_body(
            &mut reader,
            &headers,
            1000,
            Duration::from_secs(1),
            false,
            "reading test body",
        )
        .await
        .unwrap();
        match body {
            BodyOutcome::Complete(bytes) => assert_eq!(bytes.len(), 1000),
            BodyOutcome::TooLarge => panic!("exact-cap body must be accepted"),
        }
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let mut reader = reader_for(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").await;
        let headers = {
            let mut headers = HeaderBlock::default();
            headers.push_line("Transfer-Encoding: chunked\r\n").unwrap();
            headers
        };
        let body = read_body(
            &mut reader,
            &headers,
            1024,
            Duration::from_secs(1),
            false,
            "reading test body",
        )
        .await
        .unwrap();
        match body {
            BodyOutcome::Complete(bytes) => assert_eq!(bytes, b"hello world"),
            BodyOutcome::TooLarge => panic!("unexpected TooLarge"),
        }
    }

    #[tokio::test]
    async fn chunked_body_over_cap_is_rejected() {
        let mut reader = reader_for(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").await;
        let headers = {
            let mut headers = HeaderBlock::default();
            headers.push_line("Transfer-Encoding: chunked\r\n").unwrap();
            headers
        };
        let body = read_body(
            &mut reader,
            &headers,
            8,
            Duration::from_secs(1),
            false,
            "reading test body",
        )
        .await
        .unwrap();
        assert!(matches!(body, BodyOutcome::TooLarge));
    }

    #[tokio::test]
    async fn conflicting_content_lengths_error() {
        let mut headers = HeaderBlock::default();
        headers.push_line("Content-Length: 5\r\n").unwrap();
        headers.push_line("Content-Length: 6\r\n").unwrap();
        assert!(headers.content_length().is_err());
    }

    #[tokio::test]
    async fn eof_delimited_body_is_read_for_responses() {
        let mut reader = reader_for(b"stream until close").await;
        let headers = HeaderBlock::default();
        let body = read_body(
            &mut reader,
            &headers,
            1024,
            Duration::from_secs(1),
            true,
            "reading test body",
        )
        .await
        .unwrap();
        match body {
            BodyOutcome::Complete(bytes) => assert_eq!(bytes, b"stream until close"),
            BodyOutcome::TooLarge => panic!("unexpected TooLarge"),
        }
    }
}
