use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use http::Uri;
use thiserror::Error;
use tokio::net::lookup_host;
use tracing::debug;

use crate::util::is_private_ip;

/// Rejections carry enough detail for logging; the orchestrator only ever
/// surfaces a generic 403 to the client.
#[derive(Debug, Error)]
pub enum SsrfError {
    #[error("unsupported scheme '{0}'")]
    Scheme(String),
    #[error("upstream URL has no host")]
    MissingHost,
    #[error("host '{0}' is not in the allow-list")]
    HostNotAllowed(String),
    #[error("'{0}' is a private address")]
    PrivateAddress(String),
    #[error("host '{host}' resolves to private address {addr}")]
    ResolvesPrivate { host: String, addr: IpAddr },
    #[error("failed to resolve '{0}'")]
    Resolve(String),
}

/// Validates a resolved upstream URL before the transport may dial it.
/// DNS resolution is performed fresh on every call; a cached answer could
/// otherwise let a rebinding name slip through.
#[derive(Debug)]
pub struct SsrfValidator {
    allowed_hosts: HashSet<String>,
    block_private: bool,
    resolve_timeout: Duration,
}

impl SsrfValidator {
    pub fn new(allowed_hosts: &[String], block_private: bool, resolve_timeout: Duration) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .iter()
                .map(|host| host.to_ascii_lowercase())
                .collect(),
            block_private,
            resolve_timeout,
        }
    }

    pub async fn validate(&self, uri: &Uri) -> Result<(), SsrfError> {
        let scheme = uri.scheme_str().unwrap_or_default();
        if scheme != "http" && scheme != "https" {
            return Err(SsrfError::Scheme(scheme.to_string()));
        }

        let host = uri.host().ok_or(SsrfError::MissingHost)?;
        let host = host.trim_matches(['[', ']']).to_ascii_lowercase();

        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.contains(&host) {
            return Err(SsrfError::HostNotAllowed(host));
        }

        if !self.block_private {
            return Ok(());
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(ip) {
                return Err(SsrfError::PrivateAddress(host));
            }
            return Ok(());
        }

        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let addrs = tokio::time::timeout(self.resolve_timeout, lookup_host((host.as_str(), port)))
            .await
            .map_err(|_| SsrfError::Resolve(host.clone()))?
            .map_err(|err| {
                debug!(host = %host, error = %err, "DNS resolution failed during SSRF validation");
                SsrfError::Resolve(host.clone())
            })?;

        for addr in addrs {
            if is_private_ip(addr.ip()) {
                return Err(SsrfError::ResolvesPrivate {
                    host: host.clone(),
                    addr: addr.ip(),
                });
            }
        }
        Ok(())
    }
}
