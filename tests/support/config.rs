use std::path::Path;

use cachegate::cli::LogFormat;
use cachegate::settings::{
    BreakerSettings, CachePoolSettings, CacheSettings, MemoryTierSettings, MetricsAuthSettings,
    PolicySettings, RateLimitSettings, SecuritySettings, ServerSettings, Settings, SsrfSettings,
    UpstreamSettings,
};

/// Settings tuned for the integration harness: local upstream, SQLite on a
/// tempdir, SSRF off by default (the stub upstream lives on loopback).
pub fn test_settings(port: u16, entry_point: &str, db_path: &Path) -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port,
            read_timeout: 10,
            write_timeout: 10,
            idle_timeout: 30,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            enable_http2: false,
        },
        upstream: UpstreamSettings {
            entry_point: entry_point.to_string(),
            caller_key: Some("integration-test-key".to_string()),
            request_timeout: 10,
            dial_timeout: 2,
            keep_alive: 30,
            idle_timeout: 30,
            header_timeout: 5,
            response_timeout: 5,
            max_idle: 8,
            max_idle_per_host: 4,
            max_per_host: 8,
            circuit_breaker: BreakerSettings {
                enabled: true,
                threshold: 5,
                open_timeout: 60,
                half_open_max: 2,
            },
            deduplication_enabled: true,
        },
        cache: CacheSettings {
            backend: "sqlite".to_string(),
            path: db_path.to_string_lossy().into_owned(),
            default_ttl: 3600,
            memory: MemoryTierSettings {
                enabled: true,
                capacity: 128,
            },
            pool: CachePoolSettings {
                max_open: 2,
                max_idle: 1,
                max_lifetime: 300,
                max_idle_time: 60,
            },
            cleanup_interval: 3600,
        },
        security: SecuritySettings {
            rate_limit: RateLimitSettings {
                enabled: false,
                per_ip: 60,
                per_key: 120,
                burst: 10,
            },
            max_request_body: 1024 * 1024,
            max_response_body: 1024 * 1024,
            ssrf: SsrfSettings {
                enabled: false,
                allowed_hosts: Vec::new(),
                block_private_ips: true,
            },
            metrics_auth: MetricsAuthSettings {
                enabled: false,
                token: String::new(),
            },
        },
        policy: PolicySettings {
            allowed: vec!["/v1/x/*".to_string()],
            offline: Vec::new(),
        },
        log: LogFormat::Text,
    }
}
