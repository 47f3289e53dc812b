use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
enum UpstreamBehavior {
    /// 200 with the given JSON body, optionally delayed.
    Json {
        body: Arc<String>,
        delay: Duration,
    },
    /// A fixed error status with a short body.
    Status(u16),
}

/// Minimal scripted upstream: parses enough HTTP/1.1 to count requests and
/// answer each one the same way, keep-alive included.
pub struct TestUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicU32>,
    _handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn json(body: &str) -> Result<Self> {
        Self::spawn(UpstreamBehavior::Json {
            body: Arc::new(body.to_string()),
            delay: Duration::ZERO,
        })
        .await
    }

    pub async fn json_delayed(body: &str, delay: Duration) -> Result<Self> {
        Self::spawn(UpstreamBehavior::Json {
            body: Arc::new(body.to_string()),
            delay,
        })
        .await
    }

    pub async fn status(status: u16) -> Result<Self> {
        Self::spawn(UpstreamBehavior::Status(status)).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn entry_point(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    async fn spawn(behavior: UpstreamBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicU32::new(0));
        let counter = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let behavior = behavior.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, behavior, counter).await;
                });
            }
        });
        Ok(Self {
            addr,
            requests,
            _handle: handle,
        })
    }
}

async fn serve_connection(
    stream: TcpStream,
    behavior: UpstreamBehavior,
    counter: Arc<AtomicU32>,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        // Headers: only content-length matters for framing.
        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await? == 0 {
                return Ok(());
            }
            let trimmed = header.trim();
            if trimmed.is_empty() {
                break;
            }
            if let Some((name, value)) = trimmed.split_once(':')
                && name.trim().eq_ignore_ascii_case("content-length")
            {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).await?;
        }

        counter.fetch_add(1, Ordering::SeqCst);

        match &behavior {
            UpstreamBehavior::Json { body, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                reader.get_mut().write_all(response.as_bytes()).await?;
            }
            UpstreamBehavior::Status(status) => {
                let body = "upstream error";
                let response = format!(
                    "HTTP/1.1 {status} Error\r\ncontent-length: {}\r\n\r\n{body}",
                    body.len()
                );
                reader.get_mut().write_all(response.as_bytes()).await?;
            }
        }
    }
}
