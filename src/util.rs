use std::{future::Future, net::IpAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use ipnet::IpNet;
use once_cell::sync::Lazy;
use tokio::time::timeout;

/// Returns true if the provided IP address is within a private, loopback, or link-local range.
pub fn is_private_ip(addr: IpAddr) -> bool {
    if PRIVATE_NETS.iter().any(|net| net.contains(&addr)) {
        return true;
    }

    if let IpAddr::V6(v6) = addr
        && let Some(mapped) = v6.to_ipv4_mapped()
    {
        let mapped_addr = IpAddr::V4(mapped);
        return PRIVATE_NETS.iter().any(|net| net.contains(&mapped_addr));
    }

    false
}

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

/// Unix seconds, used for durable-tier timestamps.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

static PRIVATE_NETS: Lazy<Vec<IpNet>> = Lazy::new(|| {
    [
        // IPv4 local-use and special-purpose ranges (RFC 6890, RFC 5735)
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "192.168.0.0/16",
        "192.88.99.0/24",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "255.255.255.255/32",
        // IPv6 local-use and special-purpose ranges (RFC 6890)
        "::/128",
        "::1/128",
        "100::/64",
        "2001:2::/48",
        "2001:10::/28",
        "2001:20::/28",
        "2001:db8::/32",
        "fc00::/7",
        "fe80::/10",
        "ff00::/8",
    ]
    .into_iter()
    .map(|cidr| cidr.parse::<IpNet>().expect("static CIDR parse failed"))
    .collect()
});
