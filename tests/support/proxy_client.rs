use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// One-shot HTTP/1.1 client: a fresh connection per request with
/// `connection: close`, reading the body by content-length or EOF.
pub async fn send_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<ClientResponse> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect to proxy at {addr}"))?;

    let mut request = format!("{method} {path} HTTP/1.1\r\nhost: {addr}\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str(&format!(
        "content-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    ));
    stream.write_all(request.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(body).await?;
    }

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed status line '{status_line}'"))?
        .parse()
        .context("status code parse")?;

    let mut response_headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            bail!("connection closed inside response headers");
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            response_headers.insert(
                name.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            );
        }
    }

    let body = match response_headers.get("content-length") {
        Some(length) => {
            let length: usize = length.parse().context("content-length parse")?;
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            body
        }
        None => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body).await?;
            body
        }
    };

    Ok(ClientResponse {
        status,
        headers: response_headers,
        body,
    })
}

pub async fn get(addr: SocketAddr, path: &str) -> Result<ClientResponse> {
    send_request(addr, "GET", path, &[], b"").await
}
