use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use http::Uri;
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9002
}

fn default_server_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_server_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_server_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default)]
    pub enable_http2: bool,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_keep_alive() -> u64 {
    30
}

fn default_upstream_idle_timeout() -> u64 {
    90
}

fn default_header_timeout() -> u64 {
    10
}

fn default_response_timeout() -> u64 {
    30
}

fn default_max_idle() -> usize {
    32
}

fn default_max_idle_per_host() -> usize {
    8
}

fn default_max_per_host() -> usize {
    32
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    /// Absolute base URL of the single upstream API, e.g. `https://api.example.com`.
    pub entry_point: String,
    /// Caller key attached to every upstream request; without it the proxy
    /// can only serve cached entries.
    #[serde(default)]
    pub caller_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_upstream_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_header_timeout")]
    pub header_timeout: u64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_max_per_host")]
    pub max_per_host: usize,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default = "default_true")]
    pub deduplication_enabled: bool,
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_open_timeout() -> u64 {
    30
}

fn default_breaker_half_open_max() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_breaker_open_timeout")]
    pub open_timeout: u64,
    #[serde(default = "default_breaker_half_open_max")]
    pub half_open_max: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_breaker_threshold(),
            open_timeout: default_breaker_open_timeout(),
            half_open_max: default_breaker_half_open_max(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_cache_path() -> String {
    "cachegate.db".to_string()
}

fn default_ttl() -> u64 {
    86_400
}

fn default_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite file path, or the DSN for network backends.
    #[serde(default = "default_cache_path")]
    pub path: String,
    #[serde(default = "default_ttl")]
    pub default_ttl: u64,
    #[serde(default)]
    pub memory: MemoryTierSettings,
    #[serde(default)]
    pub pool: CachePoolSettings,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_cache_path(),
            default_ttl: default_ttl(),
            memory: MemoryTierSettings::default(),
            pool: CachePoolSettings::default(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_memory_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryTierSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
}

impl Default for MemoryTierSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_memory_capacity(),
        }
    }
}

fn default_pool_max_open() -> u32 {
    25
}

fn default_pool_max_idle() -> u32 {
    5
}

fn default_pool_max_lifetime() -> u64 {
    300
}

fn default_pool_max_idle_time() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachePoolSettings {
    #[serde(default = "default_pool_max_open")]
    pub max_open: u32,
    #[serde(default = "default_pool_max_idle")]
    pub max_idle: u32,
    #[serde(default = "default_pool_max_lifetime")]
    pub max_lifetime: u64,
    #[serde(default = "default_pool_max_idle_time")]
    pub max_idle_time: u64,
}

impl Default for CachePoolSettings {
    fn default() -> Self {
        Self {
            max_open: default_pool_max_open(),
            max_idle: default_pool_max_idle(),
            max_lifetime: default_pool_max_lifetime(),
            max_idle_time: default_pool_max_idle_time(),
        }
    }
}

fn default_rate_per_ip() -> u32 {
    60
}

fn default_rate_per_key() -> u32 {
    120
}

fn default_rate_burst() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests per minute for each client IP.
    #[serde(default = "default_rate_per_ip")]
    pub per_ip: u32,
    /// Requests per minute for each caller key.
    #[serde(default = "default_rate_per_key")]
    pub per_key: u32,
    #[serde(default = "default_rate_burst")]
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            per_ip: default_rate_per_ip(),
            per_key: default_rate_per_key(),
            burst: default_rate_burst(),
        }
    }
}

fn default_max_request_body() -> usize {
    10 * 1024 * 1024
}

fn default_max_response_body() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct SsrfSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_true")]
    pub block_private_ips: bool,
}

impl Default for SsrfSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hosts: Vec::new(),
            block_private_ips: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsAuthSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default = "default_max_request_body")]
    pub max_request_body: usize,
    #[serde(default = "default_max_response_body")]
    pub max_response_body: usize,
    #[serde(default)]
    pub ssrf: SsrfSettings,
    #[serde(default)]
    pub metrics_auth: MetricsAuthSettings,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitSettings::default(),
            max_request_body: default_max_request_body(),
            max_response_body: default_max_response_body(),
            ssrf: SsrfSettings::default(),
            metrics_auth: MetricsAuthSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicySettings {
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub offline: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut builder = Config::builder();
        builder = builder.add_source(File::from(config_path.to_path_buf()).required(true));
        builder = builder.add_source(
            Environment::with_prefix("CACHEGATE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|_| anyhow::anyhow!("server.host must be an IP address (got '{}')", self.server.host))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn entry_point_uri(&self) -> Result<Uri> {
        let trimmed = self.upstream.entry_point.trim_end_matches('/');
        let uri: Uri = trimmed
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid upstream.entry_point: {err}"))?;
        let scheme = uri.scheme_str().unwrap_or_default();
        ensure!(
            scheme == "http" || scheme == "https",
            "upstream.entry_point must use http or https (got '{scheme}')"
        );
        ensure!(
            uri.host().is_some(),
            "upstream.entry_point must include a host"
        );
        Ok(uri)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.server.write_timeout)
    }

    pub fn server_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.idle_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.dial_timeout)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.header_timeout)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.response_timeout)
    }

    pub fn upstream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.idle_timeout)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache.cleanup_interval)
    }

    pub fn breaker_open_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.circuit_breaker.open_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        self.entry_point_uri()?;
        ensure!(
            self.server.read_timeout > 0,
            "server.read_timeout must be greater than 0 seconds"
        );
        ensure!(
            self.server.write_timeout > 0,
            "server.write_timeout must be greater than 0 seconds"
        );
        ensure!(
            self.server.idle_timeout > 0,
            "server.idle_timeout must be greater than 0 seconds"
        );
        if self.server.tls_enabled {
            ensure!(
                self.server.tls_cert_path.is_some() && self.server.tls_key_path.is_some(),
                "server.tls_enabled requires tls_cert_path and tls_key_path"
            );
        }
        ensure!(
            self.upstream.request_timeout > 0,
            "upstream.request_timeout must be greater than 0 seconds"
        );
        ensure!(
            self.upstream.dial_timeout > 0,
            "upstream.dial_timeout must be greater than 0 seconds"
        );
        ensure!(
            self.upstream.max_per_host > 0,
            "upstream.max_per_host must be at least 1"
        );
        if self.upstream.circuit_breaker.enabled {
            ensure!(
                self.upstream.circuit_breaker.threshold > 0,
                "upstream.circuit_breaker.threshold must be at least 1"
            );
            ensure!(
                self.upstream.circuit_breaker.half_open_max > 0,
                "upstream.circuit_breaker.half_open_max must be at least 1"
            );
        }
        match self.cache.backend.as_str() {
            "sqlite" | "postgres" | "postgresql" => {}
            other => bail!("cache.backend must be sqlite or postgres (got '{other}')"),
        }
        ensure!(
            !self.cache.path.is_empty(),
            "cache.path must not be empty"
        );
        ensure!(
            self.cache.default_ttl > 0,
            "cache.default_ttl must be greater than 0 seconds"
        );
        ensure!(
            self.cache.cleanup_interval > 0,
            "cache.cleanup_interval must be greater than 0 seconds"
        );
        ensure!(
            self.cache.pool.max_open > 0,
            "cache.pool.max_open must be at least 1"
        );
        if self.cache.memory.enabled {
            ensure!(
                self.cache.memory.capacity > 0,
                "cache.memory.capacity must be at least 1"
            );
        }
        if self.security.rate_limit.enabled {
            ensure!(
                self.security.rate_limit.per_ip > 0,
                "security.rate_limit.per_ip must be at least 1"
            );
            ensure!(
                self.security.rate_limit.per_key > 0,
                "security.rate_limit.per_key must be at least 1"
            );
            ensure!(
                self.security.rate_limit.burst > 0,
                "security.rate_limit.burst must be at least 1"
            );
        }
        ensure!(
            self.security.max_request_body > 0,
            "security.max_request_body must be greater than 0"
        );
        ensure!(
            self.security.max_response_body > 0,
            "security.max_response_body must be greater than 0"
        );
        if self.security.metrics_auth.enabled {
            ensure!(
                !self.security.metrics_auth.token.is_empty(),
                "security.metrics_auth.enabled requires a token"
            );
        }
        Ok(())
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if self.cache.backend == "sqlite" {
            let path = Path::new(&self.cache.path);
            if !path.is_absolute() {
                self.cache.path = base_dir.join(path).to_string_lossy().into_owned();
            }
        }
        if let Some(cert) = self.server.tls_cert_path.clone() {
            self.server.tls_cert_path = Some(absolutize(&cert, base_dir));
        }
        if let Some(key) = self.server.tls_key_path.clone() {
            self.server.tls_key_path = Some(absolutize(&key, base_dir));
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/cachegate/cachegate.toml"),
        PathBuf::from("cachegate.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("cachegate.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        file.write_all(body.as_bytes()).expect("write config");
        path
    }

    const MINIMAL: &str = r#"
[server]
host = "127.0.0.1"
port = 9002

[upstream]
entry_point = "https://api.example.com"
caller_key = "test-key"
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let settings = Settings::load_from(&path).expect("load settings");

        assert_eq!(settings.server.port, 9002);
        assert_eq!(settings.cache.backend, "sqlite");
        assert_eq!(settings.cache.default_ttl, 86_400);
        assert!(settings.cache.memory.enabled);
        assert!(settings.security.rate_limit.enabled);
        assert!(settings.upstream.deduplication_enabled);
        assert!(settings.upstream.circuit_breaker.enabled);
        // The sqlite path is resolved relative to the config file.
        assert!(Path::new(&settings.cache.path).is_absolute());
    }

    #[test]
    fn entry_point_trailing_slash_is_trimmed() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
host = "127.0.0.1"
port = 9002

[upstream]
entry_point = "https://api.example.com/"
"#,
        );
        let settings = Settings::load_from(&path).expect("load settings");
        let uri = settings.entry_point_uri().unwrap();
        assert_eq!(uri.host(), Some("api.example.com"));
        assert_eq!(uri.path().trim_end_matches('/'), "");
    }

    #[test]
    fn rejects_non_http_entry_point() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
host = "127.0.0.1"
port = 9002

[upstream]
entry_point = "ftp://api.example.com"
"#,
        );
        let err = Settings::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn rejects_unknown_cache_backend() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!("{MINIMAL}\n[cache]\nbackend = \"redis\"\n"),
        );
        let err = Settings::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("cache.backend"));
    }

    #[test]
    fn rejects_tls_without_key_material() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
host = "127.0.0.1"
port = 9002
tls_enabled = true

[upstream]
entry_point = "https://api.example.com"
"#,
        );
        let err = Settings::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("tls_cert_path"));
    }

    #[test]
    fn rejects_metrics_auth_without_token() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!("{MINIMAL}\n[security.metrics_auth]\nenabled = true\n"),
        );
        let err = Settings::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("metrics_auth"));
    }

    #[test]
    fn policy_lists_deserialize() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!("{MINIMAL}\n[policy]\nallowed = [\"/v1/*\"]\noffline = [\"/v1/docs/*\"]\n"),
        );
        let settings = Settings::load_from(&path).expect("load settings");
        assert_eq!(settings.policy.allowed, vec!["/v1/*".to_string()]);
        assert_eq!(settings.policy.offline, vec!["/v1/docs/*".to_string()]);
    }
}
