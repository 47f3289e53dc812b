use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Plain or TLS upstream stream behind one read/write surface.
pub(super) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A kept-alive connection with enough bookkeeping to judge freshness. The
/// buffered reader travels with the stream so no bytes are stranded between
/// requests.
pub(super) struct PooledConn {
    pub(super) io: BufReader<UpstreamIo>,
    created: Instant,
    last_used: Instant,
}

impl PooledConn {
    pub(super) fn new(io: UpstreamIo) -> Self {
        let now = Instant::now();
        Self {
            io: BufReader::new(io),
            created: now,
            last_used: now,
        }
    }
}

/// LIFO free-list of idle connections to the single upstream host. Stale
/// entries (idle past `idle_timeout` or older than `max_lifetime`) are
/// discarded on the way out rather than swept.
pub(super) struct IdlePool {
    entries: Vec<PooledConn>,
    max_idle: usize,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl IdlePool {
    pub(super) fn new(max_idle: usize, idle_timeout: Duration, max_lifetime: Duration) -> Self {
        Self {
            entries: Vec::new(),
            max_idle,
            idle_timeout,
            max_lifetime,
        }
    }

    pub(super) fn take(&mut self) -> Option<PooledConn> {
        let now = Instant::now();
        while let Some(conn) = self.entries.pop() {
            let fresh = now.duration_since(conn.last_used) < self.idle_timeout
                && now.duration_since(conn.created) < self.max_lifetime;
            if fresh {
                return Some(conn);
            }
        }
        None
    }

    pub(super) fn put(&mut self, mut conn: PooledConn) {
        if self.max_idle == 0 {
            return;
        }
        conn.last_used = Instant::now();
        if self.entries.len() >= self.max_idle {
            self.entries.remove(0);
        }
        self.entries.push(conn);
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}
