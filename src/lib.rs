//! IPFS Gateway Proxy
//!
//! An HTTP proxy that fetches content-addressed data from a list of public IPFS
//! gateways, falling over from one gateway to the next until one returns an
//! acceptable response.
//!
//! # Overview
//!
//! Clients send either an `ipfs://` locator or a URL on a known gateway. The
//! proxy normalizes it into a [`ContentLocator`], expands it into one URL per
//! configured gateway, and tries those URLs strictly in order. Every attempt is
//! bounded: only allowlisted, non-internal hosts are contacted, the body is
//! capped in size, and each attempt runs under a timer.
//!
//! # Features
//!
//! - **Ordered Failover**: First acceptable gateway response wins; later gateways are never contacted
//! - **Outbound Guarding**: Protocol check, private-host block list and hostname allowlist on every hop
//! - **Bounded Fetching**: Byte cap enforced while streaming, per-attempt timeout
//! - **JSON Shape Checks**: HTML error pages served with status 200 are skipped for JSON paths
//! - **Rate Limiting**: Per-client token buckets
//! - **Metrics Collection**: Prometheus counters and histograms on a private registry
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ipfs_gateway_proxy::{IpfsProxyHandler, ProxyConfig, ProxyServer, ProxySettings};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::from_file("ipfs_proxy.yaml")?;
//! let settings = Arc::new(ProxySettings::from_config(&config)?);
//! let handler = Arc::new(IpfsProxyHandler::from_settings(Arc::clone(&settings))?);
//!
//! ProxyServer::new(handler, settings.listen_address)
//!     .run(std::future::pending())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`UriPolicy`]: Parses locators and builds gateway URLs
//! - [`host_guard`]: Block list and allowlist checks for outbound hosts
//! - [`SafeFetcher`]: One bounded, validated GET against a single URL
//! - [`GatewayRetrieval`]: Ordered failover across gateway candidates
//! - [`IpfsProxyHandler`]: HTTP routes, rate limiting and response shaping
//! - [`ProxyServer`]: hyper accept loop
//!
//! # Configuration
//!
//! Configuration is loaded from a YAML file; every field is optional:
//!
//! ```yaml
//! listen_address: "127.0.0.1:8080"
//! gateways:
//!   - "https://w3s.link/ipfs/"
//!   - "https://ipfs.io/ipfs/"
//! max_response_bytes: 2097152      # 2MiB
//! fetch_timeout_ms: 12000
//! rate_limit:
//!   capacity: 30
//!   refill_per_sec: 1.0
//! ```
//!
//! Extra outbound hostnames can be allowlisted through the
//! `IPFS_GATEWAY_ALLOWLIST` environment variable (comma or space separated,
//! `*.suffix` wildcards accepted).

pub mod config;
pub mod error;
pub mod gateway_retrieval;
pub mod handler;
pub mod host_guard;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod safe_fetch;
pub mod server;
pub mod uri_policy;

pub use config::{MetricsConfig, ProxyConfig, ProxySettings, RateLimitConfig};
pub use error::{FetchErrorKind, ProxyError, Result};
pub use gateway_retrieval::{GatewayResponse, GatewayRetrieval, RetrieveOptions};
pub use handler::IpfsProxyHandler;
pub use host_guard::{is_blocked_host, is_host_allowed, HostAllowlist};
pub use metrics::ProxyMetrics;
pub use models::{ContentLocator, FetchedResponse, GatewayCandidate};
pub use rate_limit::{RateLimitDecision, RateLimiter, TokenBucketLimiter};
pub use safe_fetch::{FetchOptions, Fetcher, RedirectPolicy, SafeFetcher};
pub use server::ProxyServer;
pub use uri_policy::{is_ipfs_uri, UriPolicy};
