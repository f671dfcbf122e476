//! Configuration management for the IPFS gateway proxy

use crate::error::{ProxyError, Result};
use crate::host_guard::{merge_allowlist, HostAllowlist};
use crate::uri_policy::UriPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Configuration for the proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Address the HTTP server binds to (default: 127.0.0.1:8080)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Gateway base URLs in failover priority order
    #[serde(default = "default_gateways")]
    pub gateways: Vec<String>,

    /// Maximum upstream response size in bytes (default: 2MiB)
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,

    /// Per-gateway attempt timeout in milliseconds (default: 12000)
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Optional budget for one whole retrieval across all gateways
    #[serde(default)]
    pub retrieval_deadline_ms: Option<u64>,

    /// Environment variable holding extra allowlisted hostnames
    #[serde(default = "default_allowlist_env")]
    pub allowlist_env: String,

    /// Maximum redirect hops followed per attempt (default: 5)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Resolve gateway hosts and reject private addresses before connecting
    #[serde(default)]
    pub dns_guard: bool,

    /// Per-client rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Prometheus metrics exposition
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log level: trace, debug, info, warn or error (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Token bucket parameters applied per client IP
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Bucket size, i.e. the burst a fresh client may issue (default: 30)
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Tokens added per second (default: 1.0)
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,

    /// Seconds after which an idle bucket may be pruned (default: 300)
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// Number of tracked clients above which pruning starts (default: 2000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

/// Configuration for the metrics route
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// Whether to serve metrics (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path metrics are served on (default: /metrics)
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
            idle_ttl_secs: default_idle_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl RateLimitConfig {
    /// Validate the rate limit configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ProxyError::ConfigError(
                "rate_limit capacity must be at least 1".to_string(),
            ));
        }

        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(ProxyError::ConfigError(format!(
                "rate_limit refill_per_sec must be a positive number, got {}",
                self.refill_per_sec
            )));
        }

        if self.max_entries == 0 {
            return Err(ProxyError::ConfigError(
                "rate_limit max_entries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_gateways() -> Vec<String> {
    [
        "https://w3s.link/ipfs/",
        "https://dweb.link/ipfs/",
        "https://gateway.pinata.cloud/ipfs/",
        "https://cloudflare-ipfs.com/ipfs/",
        "https://ipfs.filebase.io/ipfs/",
        "https://ipfs.io/ipfs/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_response_bytes() -> u64 {
    2 * 1024 * 1024 // 2MiB
}

fn default_fetch_timeout_ms() -> u64 {
    12_000
}

fn default_allowlist_env() -> String {
    "IPFS_GATEWAY_ALLOWLIST".to_string()
}

fn default_max_redirects() -> usize {
    5
}

fn default_capacity() -> u32 {
    30
}

fn default_refill_per_sec() -> f64 {
    1.0
}

fn default_idle_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_entries() -> usize {
    2000
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: default_listen_address(),
            gateways: default_gateways(),
            max_response_bytes: default_max_response_bytes(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            retrieval_deadline_ms: None,
            allowlist_env: default_allowlist_env(),
            max_redirects: default_max_redirects(),
            dns_guard: false,
            rate_limit: RateLimitConfig::default(),
            metrics: MetricsConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(ProxyConfig)` if loading and validation succeed
    /// * `Err(ProxyError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must be a socket address
    /// - at least one gateway; each an absolute http(s) URL with a host, ending in `/`
    /// - max_response_bytes and fetch_timeout_ms must be > 0
    /// - retrieval_deadline_ms, when set, must be > 0
    /// - allowlist_env must not be empty
    /// - rate_limit must be valid
    /// - metrics path must start with `/` and not collide with a proxy route when enabled
    /// - log_level must be a known level
    pub fn validate(&self) -> Result<()> {
        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            ProxyError::ConfigError(format!(
                "listen_address '{}' is not a socket address: {}",
                self.listen_address, e
            ))
        })?;

        if self.gateways.is_empty() {
            return Err(ProxyError::ConfigError(
                "at least one gateway must be configured".to_string(),
            ));
        }
        for gateway in &self.gateways {
            parse_gateway_base(gateway)?;
        }

        if self.max_response_bytes == 0 {
            return Err(ProxyError::ConfigError(
                "max_response_bytes must be greater than 0".to_string(),
            ));
        }

        if self.fetch_timeout_ms == 0 {
            return Err(ProxyError::ConfigError(
                "fetch_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.retrieval_deadline_ms == Some(0) {
            return Err(ProxyError::ConfigError(
                "retrieval_deadline_ms must be greater than 0 when set".to_string(),
            ));
        }

        if self.allowlist_env.trim().is_empty() {
            return Err(ProxyError::ConfigError(
                "allowlist_env must not be empty".to_string(),
            ));
        }

        self.rate_limit.validate()?;

        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            return Err(ProxyError::ConfigError(format!(
                "metrics path must start with '/', got '{}'",
                self.metrics.path
            )));
        }

        if self.metrics.enabled && shadows_proxy_route(&self.metrics.path) {
            return Err(ProxyError::ConfigError(format!(
                "metrics path '{}' collides with a proxy route",
                self.metrics.path
            )));
        }

        parse_log_level(&self.log_level)?;

        Ok(())
    }

    /// Parsed log level
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        parse_log_level(&self.log_level)
    }
}

/// Whether a path is already served by the proxy routes
fn shadows_proxy_route(path: &str) -> bool {
    matches!(path, "/api/ipfs" | "/health" | "/ipfs") || path.starts_with("/ipfs/")
}

fn parse_gateway_base(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| {
        ProxyError::ConfigError(format!("gateway '{}' is not a valid URL: {}", raw, e))
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProxyError::ConfigError(format!(
            "gateway '{}' must use http or https",
            raw
        )));
    }

    if url.host_str().is_none() {
        return Err(ProxyError::ConfigError(format!(
            "gateway '{}' has no host",
            raw
        )));
    }

    if !url.path().ends_with('/') || url.query().is_some() {
        return Err(ProxyError::ConfigError(format!(
            "gateway '{}' must end with '/' and carry no query",
            raw
        )));
    }

    Ok(url)
}

fn parse_log_level(raw: &str) -> Result<tracing::Level> {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => Ok(tracing::Level::TRACE),
        "debug" => Ok(tracing::Level::DEBUG),
        "info" => Ok(tracing::Level::INFO),
        "warn" => Ok(tracing::Level::WARN),
        "error" => Ok(tracing::Level::ERROR),
        other => Err(ProxyError::ConfigError(format!(
            "Invalid log_level '{}', must be one of trace, debug, info, warn, error",
            other
        ))),
    }
}

/// Runtime view of a validated [`ProxyConfig`]
///
/// Built once at startup and shared read-only by every request.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Address the server binds to
    pub listen_address: SocketAddr,
    /// Locator parsing and gateway expansion
    pub uri_policy: UriPolicy,
    /// Outbound allowlist: gateway hostnames plus any environment override
    pub allowlist: HostAllowlist,
    /// Maximum upstream response size
    pub max_response_bytes: u64,
    /// Per-attempt timeout
    pub fetch_timeout: Duration,
    /// Optional budget for a whole retrieval
    pub retrieval_deadline: Option<Duration>,
    /// Maximum redirect hops per attempt
    pub max_redirects: usize,
    /// Whether to resolve and check addresses before connecting
    pub dns_guard: bool,
    /// Rate limiting parameters
    pub rate_limit: RateLimitConfig,
    /// Metrics exposition
    pub metrics: MetricsConfig,
}

impl ProxySettings {
    /// Resolve settings, reading the allowlist override from the environment
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let overrides = std::env::var(&config.allowlist_env).ok();
        Self::with_allowlist_override(config, overrides.as_deref())
    }

    /// Resolve settings with an explicit allowlist override value
    pub fn with_allowlist_override(config: &ProxyConfig, overrides: Option<&str>) -> Result<Self> {
        config.validate()?;

        let gateways = config
            .gateways
            .iter()
            .map(|g| parse_gateway_base(g))
            .collect::<Result<Vec<_>>>()?;
        let uri_policy = UriPolicy::new(gateways);
        let allowlist = HostAllowlist::new(merge_allowlist(
            &uri_policy.gateway_hostnames(),
            overrides,
        ));

        let listen_address = config.listen_address.parse::<SocketAddr>().map_err(|e| {
            ProxyError::ConfigError(format!("Invalid listen_address: {}", e))
        })?;

        Ok(ProxySettings {
            listen_address,
            uri_policy,
            allowlist,
            max_response_bytes: config.max_response_bytes,
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms),
            retrieval_deadline: config.retrieval_deadline_ms.map(Duration::from_millis),
            max_redirects: config.max_redirects,
            dns_guard: config.dns_guard,
            rate_limit: config.rate_limit.clone(),
            metrics: config.metrics.clone(),
        })
    }
}
