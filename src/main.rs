//! IPFS Gateway Proxy Server
//!
//! Loads configuration, sets up logging, and serves the proxy routes.

use anyhow::Context;
use ipfs_gateway_proxy::{IpfsProxyHandler, ProxyConfig, ProxyServer, ProxySettings};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Main entry point for the IPFS gateway proxy
///
/// # Usage
/// ```bash
/// # Start with default config (ipfs_proxy.yaml, or built-in defaults if absent)
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "ipfs_proxy.yaml".to_string());

    let (config, loaded_from_file) = if Path::new(&config_path).exists() {
        let cfg = ProxyConfig::from_file(&config_path)
            .with_context(|| format!("Failed to load configuration from {}", config_path))?;
        (cfg, true)
    } else {
        (ProxyConfig::default(), false)
    };

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level()?)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting IPFS Gateway Proxy");
    if loaded_from_file {
        info!("Configuration loaded from: {}", config_path);
    } else {
        warn!("{} not found, using built-in defaults", config_path);
    }

    let settings = Arc::new(
        ProxySettings::from_config(&config).context("Failed to resolve proxy settings")?,
    );

    info!("  - Listen address: {}", settings.listen_address);
    info!("  - Gateways: {:?}", config.gateways);
    info!("  - Allowlist: {:?}", settings.allowlist.entries());
    info!("  - Max response size: {} bytes", settings.max_response_bytes);
    info!("  - Per-attempt timeout: {:?}", settings.fetch_timeout);
    if let Some(deadline) = settings.retrieval_deadline {
        info!("  - Retrieval deadline: {:?}", deadline);
    }
    info!(
        "  - Rate limit: {} burst, {}/s refill",
        settings.rate_limit.capacity, settings.rate_limit.refill_per_sec
    );
    info!("  - DNS guard: {}", settings.dns_guard);

    let handler = Arc::new(
        IpfsProxyHandler::from_settings(Arc::clone(&settings))
            .context("Failed to build request handler")?,
    );

    let server = ProxyServer::new(handler, settings.listen_address);
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("IPFS Gateway Proxy stopped");
    Ok(())
}
