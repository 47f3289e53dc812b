use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use rustls::ServerConfig;
use rustls::pki_types::PrivateKeyDer;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{AppContext, handler};

pub(crate) async fn start_listener(
    app: AppContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bind_addr = app.settings.listen_addr()?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);

    let tls_acceptor = if app.settings.server.tls_enabled {
        let cert = app
            .settings
            .server
            .tls_cert_path
            .as_deref()
            .ok_or_else(|| anyhow!("tls_enabled requires tls_cert_path"))?;
        let key = app
            .settings
            .server
            .tls_key_path
            .as_deref()
            .ok_or_else(|| anyhow!("tls_enabled requires tls_key_path"))?;
        Some(build_tls_acceptor(cert, key)?)
    } else {
        None
    };

    info!(address = %local_addr, tls = tls_acceptor.is_some(), "proxy listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "accepted connection");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
                }
                let connection_app = app.clone();
                let acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    let _guard = ConnectionPanicGuard { peer: peer_addr };
                    if let Err(err) = handle_connection(stream, peer_addr, connection_app, acceptor).await {
                        debug!(peer = %peer_addr, error = %err, "connection closed with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("proxy listener shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: AppContext,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
) -> Result<()> {
    match tls_acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .with_context(|| format!("TLS handshake with {peer} failed"))?;
            handler::serve_connection(tls, peer, app).await
        }
        None => handler::serve_connection(stream, peer, app).await,
    }
}

/// Counts connections that die to a panic inside the handler; the task
/// boundary contains the unwind.
struct ConnectionPanicGuard {
    peer: SocketAddr,
}

impl Drop for ConnectionPanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            crate::metrics::record_request(
                "unknown",
                http::StatusCode::INTERNAL_SERVER_ERROR,
                0,
                None,
            );
            error!(peer = %self.peer, "connection handler panicked");
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read certs from {}", path.display()))?;
    let mut reader = std::io::BufReader::new(&data[..]);
    let certs = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| anyhow!("failed to parse certs: {err}"))?;
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read key from {}", path.display()))?;
    let mut reader = std::io::BufReader::new(&data[..]);
    if let Some(key) = pkcs8_private_keys(&mut reader).next() {
        let key = key.map_err(|err| anyhow!("failed to parse pkcs8 key: {err}"))?;
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = std::io::BufReader::new(&data[..]);
    if let Some(key) = rsa_private_keys(&mut reader).next() {
        let key = key.map_err(|err| anyhow!("failed to parse rsa key: {err}"))?;
        return Ok(PrivateKeyDer::from(key));
    }

    Err(anyhow!("no valid private key found in {}", path.display()))
}

fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<tokio_rustls::TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| anyhow!("failed to build server TLS config: {err}"))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}
