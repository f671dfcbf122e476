//! Prometheus metrics for the proxy

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Content type of the Prometheus text exposition format
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Metrics for proxy requests and gateway attempts
///
/// Every collector is registered on a registry owned by this struct, so
/// several instances (one per test, say) never collide.
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,

    /// Requests handled, by route and response status
    pub requests_total: Arc<IntCounterVec>,

    /// Gateway attempts, by outcome (success or failure kind)
    pub gateway_attempts_total: Arc<IntCounterVec>,

    /// Requests rejected by the rate limiter
    pub rate_limited_total: Arc<IntCounter>,

    /// Body bytes served to clients
    pub bytes_served_total: Arc<IntCounter>,

    /// Wall time of whole retrievals
    pub retrieval_duration_seconds: Arc<HistogramVec>,
}

impl ProxyMetrics {
    /// Create metrics on a fresh private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered on the given registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "ipfs_proxy_requests_total",
                "Total number of proxy requests",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let gateway_attempts_total = IntCounterVec::new(
            Opts::new(
                "ipfs_proxy_gateway_attempts_total",
                "Total number of gateway fetch attempts by outcome",
            ),
            &["outcome"], // success, timeout, upstream-error, ...
        )?;
        registry.register(Box::new(gateway_attempts_total.clone()))?;

        let rate_limited_total = IntCounter::new(
            "ipfs_proxy_rate_limited_total",
            "Total number of requests rejected by the rate limiter",
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let bytes_served_total = IntCounter::new(
            "ipfs_proxy_bytes_served_total",
            "Total body bytes served to clients",
        )?;
        registry.register(Box::new(bytes_served_total.clone()))?;

        let retrieval_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ipfs_proxy_retrieval_duration_seconds",
                "Duration of gateway retrievals in seconds",
            )
            .buckets(vec![
                0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["result"],
        )?;
        registry.register(Box::new(retrieval_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total: Arc::new(requests_total),
            gateway_attempts_total: Arc::new(gateway_attempts_total),
            rate_limited_total: Arc::new(rate_limited_total),
            bytes_served_total: Arc::new(bytes_served_total),
            retrieval_duration_seconds: Arc::new(retrieval_duration_seconds),
        })
    }

    /// Record a handled request
    pub fn record_request(&self, route: &str, status: u16) {
        self.requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Record one gateway attempt
    pub fn record_gateway_attempt(&self, outcome: &str) {
        self.gateway_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record a rate-limited request
    pub fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    /// Record bytes written to a client
    pub fn record_bytes_served(&self, bytes: usize) {
        self.bytes_served_total.inc_by(bytes as u64);
    }

    /// Record the duration of a retrieval
    pub fn record_retrieval(&self, success: bool, duration_secs: f64) {
        let result = if success { "success" } else { "failure" };
        self.retrieval_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    /// Render all metrics in Prometheus text format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
