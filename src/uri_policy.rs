//! Content locator parsing and gateway URL construction

use crate::models::{is_dot_segment, ContentLocator, GatewayCandidate};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

/// Scheme prefix for content-addressed locators
pub const IPFS_SCHEME: &str = "ipfs://";

/// Path prefix gateways serve content under
const GATEWAY_PATH_PREFIX: &str = "/ipfs/";

/// Protocols the proxy is willing to fetch from, in URL-parser form
const ALLOWED_PROXY_PROTOCOLS: [&str; 2] = ["http:", "https:"];

/// Parses client-supplied locators and expands them into gateway URLs
///
/// Holds the ordered gateway bases; their order is the failover priority.
#[derive(Debug, Clone)]
pub struct UriPolicy {
    gateways: Vec<Url>,
    gateway_hosts: HashSet<String>,
}

impl UriPolicy {
    /// Create a new UriPolicy for the given ordered gateway bases
    ///
    /// Each base is expected to end with `/ipfs/`; bases are used verbatim.
    pub fn new(gateways: Vec<Url>) -> Self {
        let gateway_hosts = gateways
            .iter()
            .filter_map(|base| base.host_str())
            .map(|host| host.to_ascii_lowercase())
            .collect();

        UriPolicy {
            gateways,
            gateway_hosts,
        }
    }

    /// Configured gateway bases in priority order
    pub fn gateways(&self) -> &[Url] {
        &self.gateways
    }

    /// Gateway hostnames in configuration order, without duplicates
    pub fn gateway_hostnames(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.gateways
            .iter()
            .filter_map(|base| base.host_str())
            .map(|host| host.to_ascii_lowercase())
            .filter(|host| seen.insert(host.clone()))
            .collect()
    }

    /// Whether `host` is one of the configured gateways
    pub fn is_gateway_host(&self, host: &str) -> bool {
        self.gateway_hosts.contains(&host.to_ascii_lowercase())
    }

    /// Parse a client-supplied locator
    ///
    /// Accepts either `ipfs://<path>[?query]` or an absolute http(s) URL on a
    /// known gateway host whose path is `/ipfs/<rest>`.
    ///
    /// # Returns
    /// * `Some(ContentLocator)` with a normalized path and preserved query
    /// * `None` for anything else, including malformed URLs
    pub fn parse_locator(&self, raw: &str) -> Option<ContentLocator> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(rest) = trimmed.strip_prefix(IPFS_SCHEME) {
            let (path_part, search) = split_query(rest);
            let path = normalize_ipfs_path(path_part)?;
            return ContentLocator::new(path, search);
        }

        if !has_http_scheme(trimmed) {
            debug!("Rejecting locator with unsupported scheme: {}", trimmed);
            return None;
        }

        // The URL parser resolves dot segments itself, so check the raw path first
        let (raw_path, _) = split_query(trimmed);
        if raw_path.split(|c: char| c == '/' || c == '\\').any(is_dot_segment) {
            debug!("Rejecting locator with dot segments: {}", trimmed);
            return None;
        }

        let parsed = match Url::parse(trimmed) {
            Ok(url) => url,
            Err(e) => {
                debug!("Rejecting unparseable locator {}: {}", trimmed, e);
                return None;
            }
        };

        let host = parsed.host_str()?;
        if !self.is_gateway_host(host) {
            debug!("Rejecting locator on unknown gateway host: {}", host);
            return None;
        }

        let rest = parsed.path().strip_prefix(GATEWAY_PATH_PREFIX)?;
        let path = normalize_ipfs_path(rest)?;
        let search = match parsed.query() {
            Some(query) if !query.is_empty() => format!("?{}", query),
            _ => String::new(),
        };

        ContentLocator::new(path, search)
    }

    /// Build one absolute URL per configured gateway, in priority order
    pub fn build_gateway_urls(&self, locator: &ContentLocator) -> Vec<String> {
        self.candidates(locator)
            .into_iter()
            .map(|candidate| candidate.url)
            .collect()
    }

    /// Build one candidate per configured gateway, in priority order
    pub fn candidates(&self, locator: &ContentLocator) -> Vec<GatewayCandidate> {
        let suffix = locator.suffix();
        self.gateways
            .iter()
            .map(|base| GatewayCandidate {
                base: base.clone(),
                url: format!("{}{}", base.as_str(), suffix),
            })
            .collect()
    }
}

/// Whether a protocol string (with trailing colon) may be proxied
pub fn is_allowed_proxy_protocol(protocol: &str) -> bool {
    ALLOWED_PROXY_PROTOCOLS.contains(&protocol)
}

/// Whether a value is an `ipfs://` locator
pub fn is_ipfs_uri(value: &str) -> bool {
    value.trim().starts_with(IPFS_SCHEME)
}

fn has_http_scheme(value: &str) -> bool {
    let lower = value
        .get(..8)
        .unwrap_or(value)
        .to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Strip an optional `ipfs/` prefix and leading slashes; reject traversal
///
/// Encoded dot segments are rejected later by `ContentLocator::new`.
fn normalize_ipfs_path(raw: &str) -> Option<String> {
    let without_prefix = raw.strip_prefix("ipfs/").unwrap_or(raw);
    let trimmed = without_prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains("..") {
        return None;
    }
    Some(trimmed.to_string())
}

/// Split `path?query#fragment` into the path and a `?query` suffix
fn split_query(fragment: &str) -> (&str, String) {
    let without_fragment = fragment.split('#').next().unwrap_or("");
    match without_fragment.split_once('?') {
        Some((path, query)) if !query.is_empty() => (path, format!("?{}", query)),
        Some((path, _)) => (path, String::new()),
        None => (without_fragment, String::new()),
    }
}
