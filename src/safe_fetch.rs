//! Bounded single-request fetcher for upstream gateways
//!
//! [`SafeFetcher`] performs exactly one logical GET against a target URL. Before
//! any connection is made the target is checked against the protocol policy,
//! the static host block list and the caller's allowlist. The request runs
//! under a single timer covering redirects, headers and the body, and the body
//! is buffered only up to the caller's byte limit.
//!
//! With the DNS guard on, the client is built with [`GuardedResolver`], so the
//! addresses checked against the internal ranges are the ones connected to.

use crate::error::{ProxyError, Result};
use crate::host_guard::{is_blocked_host, is_blocked_ip, HostAllowlist};
use crate::models::FetchedResponse;
use crate::uri_policy::is_allowed_proxy_protocol;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, LOCATION};
use http::{HeaderMap, HeaderName, HeaderValue};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(12_000);

/// Default number of redirect hops followed
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// How 3xx responses are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectPolicy {
    /// Follow redirects, validating every hop like the first request
    #[default]
    Follow,
    /// Return the 3xx as-is, which fails as an upstream error
    Manual,
    /// Treat any redirect as an upstream error
    Error,
}

/// Per-call options for [`SafeFetcher::safe_fetch`]
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Hosts the target (and every redirect hop) must match
    pub allowlist: HostAllowlist,
    /// Maximum body size; `None` disables the limit
    pub max_bytes: Option<u64>,
    /// Time budget for the whole attempt
    pub timeout: Duration,
    /// Extra request headers
    pub headers: HeaderMap,
    /// Redirect handling
    pub redirect: RedirectPolicy,
}

impl FetchOptions {
    /// Create options with the default timeout, no size limit and no extra headers
    pub fn new(allowlist: HostAllowlist) -> Self {
        FetchOptions {
            allowlist,
            max_bytes: None,
            timeout: DEFAULT_TIMEOUT,
            headers: HeaderMap::new(),
            redirect: RedirectPolicy::default(),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = redirect;
        self
    }
}

/// Something that can perform one bounded fetch
///
/// [`SafeFetcher`] is the production implementation; gateway retrieval only
/// depends on this trait.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `target` under `options`, returning a buffered 2xx response
    async fn fetch(&self, target: &str, options: &FetchOptions) -> Result<FetchedResponse>;
}

/// HTTP(S) fetcher enforcing host, size and time bounds
pub struct SafeFetcher {
    client: Client,
    max_redirects: usize,
    dns_guard: bool,
}

impl SafeFetcher {
    /// Create a new SafeFetcher with default settings
    pub fn new() -> Result<Self> {
        Self::build(false)
    }

    /// Create a SafeFetcher, optionally resolving through [`GuardedResolver`]
    pub fn build(dns_guard: bool) -> Result<Self> {
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true);
        if dns_guard {
            builder = builder.dns_resolver(Arc::new(GuardedResolver));
        }
        let client = builder
            .build()
            .map_err(|e| ProxyError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        let mut fetcher = Self::with_client(client);
        fetcher.dns_guard = dns_guard;
        Ok(fetcher)
    }

    /// Create a SafeFetcher around an existing client
    ///
    /// The client must be built with `redirect(Policy::none())`; redirects are
    /// followed here so that every hop passes the host checks.
    pub fn with_client(client: Client) -> Self {
        SafeFetcher {
            client,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            dns_guard: false,
        }
    }

    /// Set the maximum number of redirect hops
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Whether the client resolves through [`GuardedResolver`]
    pub fn is_dns_guarded(&self) -> bool {
        self.dns_guard
    }

    /// Fetch a single target URL under the given bounds
    ///
    /// # Returns
    /// * `Ok(FetchedResponse)` with the fully buffered 2xx body
    /// * `Err(ProxyError)` tagged with the failure kind:
    ///   `BadProtocol`, `BlockedHost`, `DisallowedHost`, `UpstreamStatus`,
    ///   `TooLarge` or `Timeout`
    pub async fn safe_fetch(&self, target: &str, options: &FetchOptions) -> Result<FetchedResponse> {
        let url = Url::parse(target)
            .map_err(|e| ProxyError::BadProtocol(format!("invalid target URL: {}", e)))?;
        check_target(&url, &options.allowlist)?;

        match tokio::time::timeout(options.timeout, self.fetch_following(url, options)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Upstream timeout after {:?} for url={}", options.timeout, target);
                Err(ProxyError::Timeout {
                    timeout_ms: options.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn fetch_following(&self, mut url: Url, options: &FetchOptions) -> Result<FetchedResponse> {
        let mut hops = 0;

        loop {
            debug!("Fetching url={}", url);
            let response = self
                .client
                .get(url.clone())
                .headers(options.headers.clone())
                .send()
                .await
                .map_err(|e| {
                    if let Some(blocked) = blocked_by_resolver(&e) {
                        warn!("Refusing url={}: {}", url, blocked);
                        return blocked;
                    }
                    warn!("Request failed for url={}: {}", url, e);
                    ProxyError::upstream_status(502, format!("Request failed: {}", e))
                })?;

            let status = response.status();

            if status.is_redirection() {
                match options.redirect {
                    RedirectPolicy::Follow => {
                        hops += 1;
                        if hops > self.max_redirects {
                            return Err(ProxyError::upstream_status(
                                502,
                                format!("Too many redirects (limit {})", self.max_redirects),
                            ));
                        }
                        url = redirect_target(&url, response.headers(), status.as_u16())?;
                        check_target(&url, &options.allowlist)?;
                        debug!("Following redirect to url={}", url);
                        continue;
                    }
                    RedirectPolicy::Error => {
                        return Err(ProxyError::upstream_status(
                            status.as_u16(),
                            "Redirect not permitted",
                        ));
                    }
                    RedirectPolicy::Manual => {}
                }
            }

            if !status.is_success() {
                warn!("Upstream returned status={} for url={}", status, url);
                return Err(ProxyError::upstream_status(
                    status.as_u16(),
                    format!("Upstream error ({})", status.as_u16()),
                ));
            }

            if let Some(limit) = options.max_bytes {
                if let Some(declared) = declared_length(response.headers()) {
                    if declared > limit {
                        warn!(
                            "Declared Content-Length {} exceeds limit {} for url={}",
                            declared, limit, url
                        );
                        return Err(ProxyError::TooLarge { limit });
                    }
                }
            }

            let headers = response.headers().clone();
            let body = read_body_with_limit(response, options.max_bytes).await?;

            debug!(
                "Fetched url={}: status={}, bytes={}",
                url,
                status,
                body.len()
            );

            return Ok(FetchedResponse::new(status, headers, body, url));
        }
    }
}

#[async_trait]
impl Fetcher for SafeFetcher {
    async fn fetch(&self, target: &str, options: &FetchOptions) -> Result<FetchedResponse> {
        self.safe_fetch(target, options).await
    }
}

/// Protocol, block-list and allowlist checks for one URL
fn check_target(url: &Url, allowlist: &HostAllowlist) -> Result<()> {
    let protocol = format!("{}:", url.scheme());
    if !is_allowed_proxy_protocol(&protocol) {
        return Err(ProxyError::BadProtocol(protocol));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::DisallowedHost("missing host".to_string()))?;

    if is_blocked_host(host) {
        return Err(ProxyError::BlockedHost(host.to_string()));
    }

    if !allowlist.allows(host) {
        return Err(ProxyError::DisallowedHost(host.to_string()));
    }

    Ok(())
}

/// DNS resolver that refuses names resolving to any internal address
///
/// Installed on the client when the DNS guard is enabled. A rejected lookup
/// surfaces from [`SafeFetcher::safe_fetch`] as `BlockedHost`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_guarded(name.as_str().to_string()))
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn resolve_guarded(host: String) -> std::result::Result<Addrs, BoxError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .collect();

    if let Some(blocked) = addrs.iter().find(|addr| is_blocked_ip(addr.ip())) {
        warn!("Host {} resolves to internal address {}", host, blocked.ip());
        let err = ProxyError::BlockedHost(format!("{} resolves to {}", host, blocked.ip()));
        return Err(Box::new(err));
    }

    Ok(Box::new(addrs.into_iter()))
}

/// Find a resolver rejection in a request error's source chain
fn blocked_by_resolver(err: &reqwest::Error) -> Option<ProxyError> {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(ProxyError::BlockedHost(host)) = inner.downcast_ref::<ProxyError>() {
            return Some(ProxyError::BlockedHost(host.clone()));
        }
        source = inner.source();
    }
    None
}

fn redirect_target(current: &Url, headers: &HeaderMap, status: u16) -> Result<Url> {
    let location = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProxyError::upstream_status(status, "Redirect without Location header"))?;

    current.join(location).map_err(|e| {
        ProxyError::upstream_status(status, format!("Invalid redirect location: {}", e))
    })
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Stream the body, failing as soon as the running total passes `max_bytes`
///
/// Returning early drops the response, which aborts the transfer.
async fn read_body_with_limit(mut response: reqwest::Response, max_bytes: Option<u64>) -> Result<Bytes> {
    let mut buffer = BytesMut::new();

    while let Some(chunk) = response.chunk().await.map_err(|e| {
        ProxyError::upstream_status(502, format!("Failed to read response body: {}", e))
    })? {
        append_within_limit(&mut buffer, &chunk, max_bytes)?;
    }

    Ok(buffer.freeze())
}

fn append_within_limit(buffer: &mut BytesMut, chunk: &[u8], max_bytes: Option<u64>) -> Result<()> {
    if let Some(limit) = max_bytes {
        let total = buffer.len() as u64 + chunk.len() as u64;
        if total > limit {
            return Err(ProxyError::TooLarge { limit });
        }
    }
    buffer.extend_from_slice(chunk);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> HostAllowlist {
        HostAllowlist::new(["ipfs.io", "*.dweb.link"])
    }

    #[test]
    fn test_safe_fetcher_creation() {
        let fetcher = SafeFetcher::new();
        assert!(fetcher.is_ok());
        let fetcher = fetcher.unwrap().with_max_redirects(2);
        assert_eq!(fetcher.max_redirects, 2);
        assert!(!fetcher.is_dns_guarded());

        let guarded = SafeFetcher::build(true).unwrap();
        assert!(guarded.is_dns_guarded());
    }

    #[tokio::test]
    async fn test_guarded_resolver_rejects_loopback() {
        let name: Name = "localhost".parse().unwrap();
        let err = match GuardedResolver.resolve(name).await {
            Ok(_) => panic!("localhost must not resolve through the guard"),
            Err(err) => err,
        };
        let err = err.downcast_ref::<ProxyError>().unwrap();
        assert!(matches!(err, ProxyError::BlockedHost(host) if host.starts_with("localhost")));
    }

    #[tokio::test]
    async fn test_resolver_rejection_maps_to_blocked_host() {
        let client = Client::builder()
            .redirect(Policy::none())
            .dns_resolver(Arc::new(GuardedResolver))
            .build()
            .unwrap();

        // Port 9 is never contacted; the lookup fails first
        let err = client.get("http://localhost:9/ipfs/bafy").send().await.unwrap_err();
        let mapped = blocked_by_resolver(&err).unwrap();
        assert!(matches!(mapped, ProxyError::BlockedHost(_)));
        assert_eq!(mapped.to_http_status(), 400);
    }

    #[test]
    fn test_fetch_options_defaults() {
        let options = FetchOptions::new(allowlist());
        assert_eq!(options.timeout, Duration::from_secs(12));
        assert_eq!(options.max_bytes, None);
        assert_eq!(options.redirect, RedirectPolicy::Follow);
        assert!(options.headers.is_empty());
    }

    #[test]
    fn test_check_target() {
        let list = allowlist();
        let ok = Url::parse("https://ipfs.io/ipfs/bafy").unwrap();
        assert!(check_target(&ok, &list).is_ok());

        let ftp = Url::parse("ftp://ipfs.io/ipfs/bafy").unwrap();
        assert_eq!(
            check_target(&ftp, &list).unwrap_err(),
            ProxyError::BadProtocol("ftp:".to_string())
        );

        let local = Url::parse("http://127.0.0.1:5001/api").unwrap();
        assert!(matches!(check_target(&local, &list), Err(ProxyError::BlockedHost(_))));

        let v6 = Url::parse("http://[::1]/").unwrap();
        assert!(matches!(check_target(&v6, &list), Err(ProxyError::BlockedHost(_))));

        let other = Url::parse("https://evil.com/ipfs/bafy").unwrap();
        assert!(matches!(check_target(&other, &list), Err(ProxyError::DisallowedHost(_))));
    }

    #[test]
    fn test_append_within_limit() {
        let mut buffer = BytesMut::new();
        assert!(append_within_limit(&mut buffer, b"hello", Some(8)).is_ok());
        assert!(append_within_limit(&mut buffer, b"abc", Some(8)).is_ok());
        assert_eq!(&buffer[..], b"helloabc");
        assert_eq!(
            append_within_limit(&mut buffer, b"!", Some(8)).unwrap_err(),
            ProxyError::TooLarge { limit: 8 }
        );
        assert!(append_within_limit(&mut buffer, &[0u8; 1024], None).is_ok());
    }

    #[test]
    fn test_declared_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(declared_length(&headers), Some(42));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(declared_length(&headers), None);
    }

    #[test]
    fn test_redirect_target() {
        let current = Url::parse("https://ipfs.io/ipfs/bafy").unwrap();
        let mut headers = HeaderMap::new();
        assert!(redirect_target(&current, &headers, 302).is_err());

        headers.insert(LOCATION, HeaderValue::from_static("/ipfs/bafy/"));
        assert_eq!(
            redirect_target(&current, &headers, 301).unwrap().as_str(),
            "https://ipfs.io/ipfs/bafy/"
        );

        headers.insert(LOCATION, HeaderValue::from_static("http://10.0.0.1/"));
        let hop = redirect_target(&current, &headers, 302).unwrap();
        assert!(matches!(check_target(&hop, &allowlist()), Err(ProxyError::BlockedHost(_))));
    }

    #[tokio::test]
    async fn test_safe_fetch_rejects_before_connecting() {
        let fetcher = SafeFetcher::new().unwrap();
        let options = FetchOptions::new(allowlist());

        let err = fetcher.safe_fetch("not-a-url", &options).await.unwrap_err();
        assert_eq!(err.to_http_status(), 400);

        let err = fetcher
            .safe_fetch("http://localhost/ipfs/bafy", &options)
            .await
            .unwrap_err();
        assert_eq!(err.to_http_status(), 400);

        let err = fetcher
            .safe_fetch("https://evil.com/ipfs/bafy", &options)
            .await
            .unwrap_err();
        assert_eq!(err.to_http_status(), 403);
    }
}
