use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cachegate::settings::Settings;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Reserves a free loopback port. The listener is dropped before the proxy
/// binds it, so a collision is possible but vanishingly rare in practice.
pub async fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// A running proxy instance on a scratch database.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub tempdir: TempDir,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ProxyHarness {
    /// Starts the daemon with settings derived from `test_settings` and
    /// customized by `adjust`, then waits for the listener to accept.
    pub async fn start<F>(entry_point: &str, adjust: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let tempdir = TempDir::new()?;
        Self::start_with_dir(entry_point, tempdir, adjust).await
    }

    /// Variant that reuses an existing scratch directory (and therefore the
    /// SQLite database inside it) across restarts.
    pub async fn start_with_dir<F>(entry_point: &str, tempdir: TempDir, adjust: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let port = free_port().await?;
        let db_path = tempdir.path().join("cache.db");
        let mut settings = super::test_settings(port, entry_point, &db_path);
        adjust(&mut settings);
        settings.validate().context("harness settings invalid")?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(cachegate::run_with_shutdown(settings, shutdown_rx));

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
        wait_until_listening(addr).await?;

        Ok(Self {
            addr,
            tempdir,
            shutdown,
            task,
        })
    }

    /// Stops the daemon and hands back the scratch directory for restarts.
    pub async fn stop(self) -> Result<TempDir> {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        Ok(self.tempdir)
    }
}

async fn wait_until_listening(addr: SocketAddr) -> Result<()> {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("proxy did not start listening on {addr}");
}
