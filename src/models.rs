//! Core data models for the IPFS gateway proxy

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use url::Url;

/// Normalized reference to content-addressed data, independent of any gateway
///
/// `path` never starts with `/`, never contains `..` and is never empty. No
/// segment decodes (under any depth of percent-encoding) to `.` or `..`.
/// `search` is either empty or starts with `?`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentLocator {
    path: String,
    search: String,
}

impl ContentLocator {
    /// Create a locator from an already-normalized path and query suffix
    ///
    /// # Returns
    /// * `Some(ContentLocator)` if the invariants hold
    /// * `None` if the path is empty, starts with `/`, contains `..`,
    ///   has an encoded dot segment, or the search is non-empty without a
    ///   leading `?`
    pub fn new(path: impl Into<String>, search: impl Into<String>) -> Option<Self> {
        let path = path.into();
        let search = search.into();

        if path.is_empty() || path.starts_with('/') || path.contains("..") {
            return None;
        }
        if path.split('/').any(is_dot_segment) {
            return None;
        }
        if !search.is_empty() && !search.starts_with('?') {
            return None;
        }

        Some(ContentLocator { path, search })
    }

    /// Normalized content path, e.g. `bafy.../manifest.json`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query suffix including the leading `?`, or empty
    pub fn search(&self) -> &str {
        &self.search
    }

    /// Whether the caller should expect a JSON document at this path
    pub fn expects_json(&self) -> bool {
        self.path.ends_with(".json") || self.path.contains("manifest.json")
    }

    /// Path and query joined, as appended to a gateway base
    pub fn suffix(&self) -> String {
        format!("{}{}", self.path, self.search)
    }

    /// Render back to `ipfs://` form
    pub fn to_ipfs_uri(&self) -> String {
        format!("ipfs://{}", self.suffix())
    }
}

/// Whether a path segment percent-decodes to `.` or `..`
///
/// Decoding repeats until the segment stops changing, so `%252e%252e`
/// is caught as well as `%2e%2e` and `.%2E`.
pub fn is_dot_segment(segment: &str) -> bool {
    let mut current = segment.as_bytes().to_vec();
    loop {
        if current == b"." || current == b".." {
            return true;
        }
        let decoded = urlencoding::decode_binary(&current).into_owned();
        if decoded == current {
            return false;
        }
        current = decoded;
    }
}

/// One absolute URL formed by joining a gateway base with a locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCandidate {
    /// Configured gateway base, e.g. `https://w3s.link/ipfs/`
    pub base: Url,
    /// Absolute URL to fetch
    pub url: String,
}

impl GatewayCandidate {
    /// Hostname of the gateway base (lowercase, as parsed)
    pub fn host(&self) -> Option<&str> {
        self.base.host_str()
    }
}

/// A fully buffered successful upstream response
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// Upstream status code (always 2xx)
    pub status: StatusCode,
    /// Upstream response headers
    pub headers: HeaderMap,
    /// Buffered body bytes
    pub body: Bytes,
    /// URL the body was actually served from, after redirects
    pub final_url: Url,
}

impl FetchedResponse {
    /// Create a new FetchedResponse
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, final_url: Url) -> Self {
        FetchedResponse {
            status,
            headers,
            body,
            final_url,
        }
    }

    /// Number of body bytes read
    pub fn byte_size(&self) -> usize {
        self.body.len()
    }

    /// Upstream Content-Type, if present and valid ASCII
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}
