//! HTTP entrypoints for IPFS content retrieval
//!
//! Routes:
//! - `GET /api/ipfs?url=<locator>` - locator passed as a query parameter
//! - `GET /ipfs/<cid>/<path...>` - locator taken from the request path
//! - `GET /health` - liveness probe
//! - `GET <metrics path>` - Prometheus exposition, when enabled
//!
//! Every failure is answered with a JSON envelope `{"error", "requestId"}`.

use crate::config::ProxySettings;
use crate::error::{ProxyError, Result};
use crate::gateway_retrieval::{GatewayResponse, GatewayRetrieval, RetrieveOptions};
use crate::metrics::{ProxyMetrics, METRICS_CONTENT_TYPE};
use crate::models::ContentLocator;
use crate::rate_limit::{client_key, RateLimiter, TokenBucketLimiter};
use crate::safe_fetch::{Fetcher, SafeFetcher};
use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    HOST, RETRY_AFTER, TRANSFER_ENCODING,
};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Route of the query-parameter entrypoint
pub const API_ROUTE: &str = "/api/ipfs";

/// Route prefix of the path entrypoint
pub const PATH_ROUTE: &str = "/ipfs";

/// Route of the liveness probe
pub const HEALTH_ROUTE: &str = "/health";

const MSG_RATE_LIMITED: &str = "Rate limit exceeded";
const MSG_MISSING_URL: &str = "Missing url query param.";
const MSG_MISSING_PATH: &str = "Missing IPFS path.";
const MSG_UNSUPPORTED: &str = "Unsupported IPFS url.";
const MSG_ALL_FAILED: &str = "All IPFS gateways failed.";

const SUCCESS_CACHE_CONTROL: &str = "public, max-age=300";

/// Upstream headers not forwarded, since the body is re-framed
const STRIPPED_HEADERS: [HeaderName; 3] = [CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING];

static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope<'a> {
    pub error: &'a str,
    #[serde(rename = "requestId")]
    pub request_id: &'a str,
}

/// Per-request context carried through logging and responses
struct RequestContext {
    request_id: String,
    route: &'static str,
    started: Instant,
}

/// Handles proxy requests against the configured gateways
pub struct IpfsProxyHandler {
    settings: Arc<ProxySettings>,
    retrieval: GatewayRetrieval,
    limiter: Arc<dyn RateLimiter>,
    metrics: Arc<ProxyMetrics>,
}

impl IpfsProxyHandler {
    /// Create a handler from its parts
    pub fn new(
        settings: Arc<ProxySettings>,
        fetcher: Arc<dyn Fetcher>,
        limiter: Arc<dyn RateLimiter>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let retrieval = GatewayRetrieval::new(Arc::new(settings.uri_policy.clone()), fetcher)
            .with_fetch_timeout(settings.fetch_timeout)
            .with_deadline(settings.retrieval_deadline)
            .with_metrics(Arc::clone(&metrics));

        IpfsProxyHandler {
            settings,
            retrieval,
            limiter,
            metrics,
        }
    }

    /// Create a handler with the production fetcher, limiter and metrics
    pub fn from_settings(settings: Arc<ProxySettings>) -> Result<Self> {
        let fetcher = SafeFetcher::build(settings.dns_guard)?
            .with_max_redirects(settings.max_redirects);
        let limiter = TokenBucketLimiter::new(&settings.rate_limit);
        let metrics = ProxyMetrics::new()
            .map_err(|e| ProxyError::InternalError(format!("Failed to create metrics: {}", e)))?;

        Ok(Self::new(
            settings,
            Arc::new(fetcher),
            Arc::new(limiter),
            Arc::new(metrics),
        ))
    }

    /// Shared metrics
    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    /// Handle one HTTP request
    ///
    /// Never fails: every outcome, including internal errors, is a response.
    pub async fn handle<B>(&self, req: Request<B>, peer: Option<SocketAddr>) -> Response<Full<Bytes>> {
        let (parts, _) = req.into_parts();
        let route = route_label(
            parts.uri.path(),
            &self.settings.metrics.path,
            self.settings.metrics.enabled,
        );
        let ctx = RequestContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            route,
            started: Instant::now(),
        };

        let response = if parts.method != Method::GET && parts.method != Method::HEAD {
            error_response(&ctx, StatusCode::METHOD_NOT_ALLOWED, "Method not allowed.")
        } else {
            match route {
                HEALTH_ROUTE => health_response(),
                API_ROUTE => self.handle_api(&parts, peer, &ctx).await,
                PATH_ROUTE => self.handle_path(&parts, peer, &ctx).await,
                "metrics" => self.metrics_response(&ctx),
                _ => error_response(&ctx, StatusCode::NOT_FOUND, "Not found."),
            }
        };

        self.finish(&ctx, response)
    }

    /// `GET /api/ipfs?url=<locator>`
    async fn handle_api(
        &self,
        req: &Parts,
        peer: Option<SocketAddr>,
        ctx: &RequestContext,
    ) -> Response<Full<Bytes>> {
        if let Some(limited) = self.check_rate_limit(&req.headers, peer, ctx).await {
            return limited;
        }

        let raw = match query_param(req.uri.query(), "url") {
            Some(raw) => raw,
            None => return error_response(ctx, StatusCode::BAD_REQUEST, MSG_MISSING_URL),
        };

        let locator = match self.settings.uri_policy.parse_locator(&raw) {
            Some(locator) => locator,
            None => return error_response(ctx, StatusCode::BAD_REQUEST, MSG_UNSUPPORTED),
        };

        self.retrieve(&locator, None, ctx).await
    }

    /// `GET /ipfs/<segments...>`
    async fn handle_path(
        &self,
        req: &Parts,
        peer: Option<SocketAddr>,
        ctx: &RequestContext,
    ) -> Response<Full<Bytes>> {
        if let Some(limited) = self.check_rate_limit(&req.headers, peer, ctx).await {
            return limited;
        }

        let raw = match locator_from_path(req.uri.path(), req.uri.query()) {
            Some(raw) => raw,
            None => return error_response(ctx, StatusCode::BAD_REQUEST, MSG_MISSING_PATH),
        };

        let locator = match self.settings.uri_policy.parse_locator(&raw) {
            Some(locator) => locator,
            None => return error_response(ctx, StatusCode::BAD_REQUEST, MSG_UNSUPPORTED),
        };

        let request_host = request_hostname(req);
        self.retrieve(&locator, request_host, ctx).await
    }

    async fn check_rate_limit(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        ctx: &RequestContext,
    ) -> Option<Response<Full<Bytes>>> {
        let ip = client_ip(headers, peer);
        let decision = self.limiter.check(&client_key(&ip)).await;
        if decision.allowed {
            return None;
        }

        self.metrics.record_rate_limited();
        warn!(
            "Rate limit exceeded for client={} request_id={}",
            ip, ctx.request_id
        );
        let mut response = error_response(ctx, StatusCode::TOO_MANY_REQUESTS, MSG_RATE_LIMITED);
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
        Some(response)
    }

    async fn retrieve(
        &self,
        locator: &ContentLocator,
        exclude_host: Option<String>,
        ctx: &RequestContext,
    ) -> Response<Full<Bytes>> {
        let options = RetrieveOptions {
            expects_json: locator.expects_json(),
            allowlist: self.settings.allowlist.clone(),
            max_bytes: Some(self.settings.max_response_bytes),
            exclude_host,
        };

        debug!(
            "request_id={} retrieving {}",
            ctx.request_id,
            locator.to_ipfs_uri()
        );

        let started = Instant::now();
        let result = self.retrieval.retrieve(locator, &options).await;
        self.metrics
            .record_retrieval(result.is_ok(), started.elapsed().as_secs_f64());

        match result {
            Ok(served) => success_response(ctx, served),
            Err(ProxyError::AllGatewaysFailed { attempts }) => {
                warn!(
                    "request_id={} exhausted {} gateway attempts for {}",
                    ctx.request_id,
                    attempts,
                    locator.to_ipfs_uri()
                );
                error_response(ctx, StatusCode::BAD_GATEWAY, MSG_ALL_FAILED)
            }
            Err(e) => {
                error!("request_id={} retrieval error: {}", ctx.request_id, e);
                error_response(ctx, StatusCode::BAD_GATEWAY, MSG_ALL_FAILED)
            }
        }
    }

    fn metrics_response(&self, ctx: &RequestContext) -> Response<Full<Bytes>> {
        match self.metrics.gather_text() {
            Ok(text) => {
                let mut response = Response::new(Full::new(Bytes::from(text)));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(METRICS_CONTENT_TYPE));
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                error_response(ctx, StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics.")
            }
        }
    }

    fn finish(&self, ctx: &RequestContext, mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(X_REQUEST_ID.clone(), value);
        }

        let status = response.status().as_u16();
        let body_size = hyper::body::Body::size_hint(response.body())
            .exact()
            .unwrap_or(0);

        self.metrics.record_request(ctx.route, status);
        if response.status().is_success() && ctx.route != "metrics" {
            self.metrics.record_bytes_served(body_size as usize);
        }

        info!(
            "route={} status={} request_id={} body_size={} elapsed_ms={}",
            ctx.route,
            status,
            ctx.request_id,
            body_size,
            ctx.started.elapsed().as_millis()
        );
        response
    }
}

/// Classify a request path into a route label
fn route_label(path: &str, metrics_path: &str, metrics_enabled: bool) -> &'static str {
    if path == API_ROUTE {
        API_ROUTE
    } else if path == PATH_ROUTE || path.starts_with("/ipfs/") {
        PATH_ROUTE
    } else if path == HEALTH_ROUTE {
        HEALTH_ROUTE
    } else if metrics_enabled && path == metrics_path {
        "metrics"
    } else {
        "unknown"
    }
}

/// First non-empty value of a query parameter, form-decoded
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Build an `ipfs://` locator from a `/ipfs/<segments...>` path and query
///
/// Segments are percent-decoded and rejoined with `/`; empty segments are
/// dropped. Returns `None` when no segments remain.
pub fn locator_from_path(path: &str, query: Option<&str>) -> Option<String> {
    let rest = path.strip_prefix(PATH_ROUTE)?;
    let segments: Vec<String> = rest
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match urlencoding::decode(segment) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => segment.to_string(),
        })
        .collect();

    if segments.is_empty() {
        return None;
    }

    let search = match query {
        Some(q) if !q.is_empty() => format!("?{}", q),
        _ => String::new(),
    };
    Some(format!("ipfs://{}{}", segments.join("/"), search))
}

/// Client address: first `x-forwarded-for` entry, then `x-real-ip`, then the peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get(&X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Hostname the client addressed, without port, lowercased
fn request_hostname(req: &Parts) -> Option<String> {
    let authority = match req.uri.host() {
        Some(host) => host.to_string(),
        None => req.headers.get(HOST)?.to_str().ok()?.to_string(),
    };
    strip_port(&authority).map(|host| host.to_ascii_lowercase())
}

fn strip_port(authority: &str) -> Option<&str> {
    let host = if authority.starts_with('[') {
        // [v6]:port keeps its brackets, matching URL host form
        match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        }
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn success_response(ctx: &RequestContext, served: GatewayResponse) -> Response<Full<Bytes>> {
    let GatewayResponse {
        response: upstream,
        candidate,
        attempts,
    } = served;

    debug!(
        "request_id={} served by {} after {} attempts",
        ctx.request_id, candidate.base, attempts
    );

    let mut headers = upstream.headers;
    for name in STRIPPED_HEADERS.iter() {
        headers.remove(name);
    }
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(SUCCESS_CACHE_CONTROL));

    let mut response = Response::new(Full::new(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}

fn health_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"{\"status\":\"ok\"}")));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(ctx: &RequestContext, status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let envelope = ErrorEnvelope {
        error: message,
        request_id: &ctx.request_id,
    };
    let body = match serde_json::to_vec(&envelope) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize error envelope: {}", e);
            b"{\"error\":\"Internal error.\"}".to_vec()
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
