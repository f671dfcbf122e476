//! Ordered failover across redundant IPFS gateways

use crate::error::{ProxyError, Result};
use crate::host_guard::HostAllowlist;
use crate::metrics::ProxyMetrics;
use crate::models::{ContentLocator, FetchedResponse, GatewayCandidate};
use crate::safe_fetch::{FetchOptions, Fetcher, DEFAULT_TIMEOUT};
use crate::uri_policy::UriPolicy;
use http::header::ACCEPT;
use http::HeaderValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Options for one retrieval
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Require a JSON-looking body; HTML or non-JSON 200s are skipped
    pub expects_json: bool,
    /// Outbound allowlist passed to every attempt
    pub allowlist: HostAllowlist,
    /// Per-attempt body size limit
    pub max_bytes: Option<u64>,
    /// Skip candidates on this hostname (the proxy's own host)
    pub exclude_host: Option<String>,
}

/// Successful retrieval
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// The accepted upstream response
    pub response: FetchedResponse,
    /// Gateway candidate that served it
    pub candidate: GatewayCandidate,
    /// Number of attempts made, including the successful one
    pub attempts: usize,
}

/// Record of one rejected attempt, kept for logging
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// URL that was attempted
    pub url: String,
    /// Why it was rejected
    pub error: ProxyError,
}

/// Tries each gateway candidate once, in priority order, until one is acceptable
pub struct GatewayRetrieval {
    policy: Arc<UriPolicy>,
    fetcher: Arc<dyn Fetcher>,
    fetch_timeout: Duration,
    deadline: Option<Duration>,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl GatewayRetrieval {
    /// Create a new GatewayRetrieval
    ///
    /// # Arguments
    /// * `policy` - Gateway list and locator expansion
    /// * `fetcher` - Performs each bounded attempt
    pub fn new(policy: Arc<UriPolicy>, fetcher: Arc<dyn Fetcher>) -> Self {
        GatewayRetrieval {
            policy,
            fetcher,
            fetch_timeout: DEFAULT_TIMEOUT,
            deadline: None,
            metrics: None,
        }
    }

    /// Set the per-attempt timeout
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Bound the whole retrieval; attempt timeouts are clamped to what remains
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Record attempt outcomes
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Gateway candidates for a locator, minus any on the excluded host
    pub fn candidates(&self, locator: &ContentLocator, exclude_host: Option<&str>) -> Vec<GatewayCandidate> {
        let candidates = self.policy.candidates(locator);
        match exclude_host {
            Some(excluded) => {
                let excluded = excluded.to_ascii_lowercase();
                candidates
                    .into_iter()
                    .filter(|candidate| {
                        let keep = candidate.host() != Some(excluded.as_str());
                        if !keep {
                            debug!("Excluding self-referential gateway {}", candidate.base);
                        }
                        keep
                    })
                    .collect()
            }
            None => candidates,
        }
    }

    /// Retrieve content for a locator
    ///
    /// Attempts are strictly sequential; the first acceptable response wins and
    /// the remaining candidates are never contacted.
    ///
    /// # Returns
    /// * `Ok(GatewayResponse)` from the first acceptable gateway
    /// * `Err(ProxyError::AllGatewaysFailed)` once every candidate was rejected
    pub async fn retrieve(&self, locator: &ContentLocator, options: &RetrieveOptions) -> Result<GatewayResponse> {
        let started = Instant::now();
        let candidates = self.candidates(locator, options.exclude_host.as_deref());
        let mut failures: Vec<AttemptFailure> = Vec::new();

        debug!(
            "Retrieving {} across {} gateways (expects_json={})",
            locator.to_ipfs_uri(),
            candidates.len(),
            options.expects_json
        );

        for candidate in candidates {
            let timeout = match self.deadline {
                Some(budget) => {
                    let remaining = budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        warn!(
                            "Retrieval deadline of {:?} spent after {} attempts",
                            budget,
                            failures.len()
                        );
                        break;
                    }
                    remaining.min(self.fetch_timeout)
                }
                None => self.fetch_timeout,
            };

            let mut fetch_options = FetchOptions::new(options.allowlist.clone())
                .with_max_bytes(options.max_bytes)
                .with_timeout(timeout);
            if options.expects_json {
                fetch_options = fetch_options
                    .with_header(ACCEPT, HeaderValue::from_static("application/json"));
            }

            let outcome = match self.fetcher.fetch(&candidate.url, &fetch_options).await {
                Ok(response) => check_shape(&response, options.expects_json).map(|_| response),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) => {
                    let attempts = failures.len() + 1;
                    self.record_attempt("success");
                    info!(
                        "Gateway {} served {} ({} bytes) on attempt {}",
                        candidate.base,
                        locator.to_ipfs_uri(),
                        response.byte_size(),
                        attempts
                    );
                    return Ok(GatewayResponse {
                        response,
                        candidate,
                        attempts,
                    });
                }
                Err(e) if e.should_try_next_gateway() => {
                    self.record_attempt(e.label());
                    warn!(
                        "Gateway attempt {} failed for url={} [{}]: {}",
                        failures.len() + 1,
                        candidate.url,
                        e.label(),
                        e
                    );
                    failures.push(AttemptFailure {
                        url: candidate.url,
                        error: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            "All gateways failed for {}: {}",
            locator.to_ipfs_uri(),
            summarize(&failures)
        );
        Err(ProxyError::AllGatewaysFailed {
            attempts: failures.len(),
        })
    }

    fn record_attempt(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_gateway_attempt(outcome);
        }
    }
}

/// Reject 200 responses whose content does not have the expected shape
fn check_shape(response: &FetchedResponse, expects_json: bool) -> Result<()> {
    if !expects_json {
        return Ok(());
    }

    if response
        .content_type()
        .map(is_html_content_type)
        .unwrap_or(false)
    {
        return Err(ProxyError::UnexpectedContent(
            "HTML served where JSON was expected".to_string(),
        ));
    }

    if !looks_like_json(&response.body) {
        return Err(ProxyError::UnexpectedContent(
            "body does not look like JSON".to_string(),
        ));
    }

    Ok(())
}

/// Whether a Content-Type header value denotes HTML
pub fn is_html_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/html")
}

/// Whether a body starts (after leading whitespace) with `{` or `[`
pub fn looks_like_json(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

fn summarize(failures: &[AttemptFailure]) -> String {
    if failures.is_empty() {
        return "no gateway attempted".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{} => {}", f.url, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}
