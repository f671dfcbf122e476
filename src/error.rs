//! Error types for the IPFS gateway proxy

use std::fmt;
use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Classification of a failed single-gateway fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// Target URL uses a protocol other than http/https
    BadProtocol,
    /// Target host is loopback, private or otherwise internal
    BlockedHost,
    /// Target host is not on the outbound allowlist
    DisallowedHost,
    /// Gateway answered with a non-success status or the transport failed
    UpstreamError,
    /// Response exceeded the configured byte limit
    TooLarge,
    /// Attempt did not complete within its time budget
    Timeout,
}

impl FetchErrorKind {
    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::BadProtocol => "bad-protocol",
            FetchErrorKind::BlockedHost => "blocked-host",
            FetchErrorKind::DisallowedHost => "disallowed-host",
            FetchErrorKind::UpstreamError => "upstream-error",
            FetchErrorKind::TooLarge => "too-large",
            FetchErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types that can occur in the proxy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Unsupported protocol: {0}")]
    BadProtocol(String),

    #[error("Blocked host: {0}")]
    BlockedHost(String),

    #[error("Host not allowed: {0}")]
    DisallowedHost(String),

    #[error("Upstream error ({status}): {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("Response too large (limit {limit} bytes)")]
    TooLarge { limit: u64 },

    #[error("Upstream timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Unexpected content: {0}")]
    UnexpectedContent(String),

    #[error("All IPFS gateways failed after {attempts} attempts")]
    AllGatewaysFailed { attempts: usize },

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl ProxyError {
    /// Tagged kind for failures produced by a single fetch attempt
    ///
    /// Returns `None` for errors that are not transport-level attempt failures,
    /// including the soft content-shape rejection.
    pub fn kind(&self) -> Option<FetchErrorKind> {
        match self {
            ProxyError::BadProtocol(_) => Some(FetchErrorKind::BadProtocol),
            ProxyError::BlockedHost(_) => Some(FetchErrorKind::BlockedHost),
            ProxyError::DisallowedHost(_) => Some(FetchErrorKind::DisallowedHost),
            ProxyError::UpstreamStatus { .. } => Some(FetchErrorKind::UpstreamError),
            ProxyError::TooLarge { .. } => Some(FetchErrorKind::TooLarge),
            ProxyError::Timeout { .. } => Some(FetchErrorKind::Timeout),
            ProxyError::ConfigError(_)
            | ProxyError::IoError(_)
            | ProxyError::HttpError(_)
            | ProxyError::UnexpectedContent(_)
            | ProxyError::AllGatewaysFailed { .. }
            | ProxyError::InternalError(_) => None,
        }
    }

    /// Determine if gateway retrieval should move on to the next candidate
    ///
    /// Every per-attempt failure qualifies, whatever its kind: a different
    /// gateway is an independent source for the same content.
    pub fn should_try_next_gateway(&self) -> bool {
        match self {
            ProxyError::BadProtocol(_)
            | ProxyError::BlockedHost(_)
            | ProxyError::DisallowedHost(_)
            | ProxyError::UpstreamStatus { .. }
            | ProxyError::TooLarge { .. }
            | ProxyError::Timeout { .. }
            | ProxyError::UnexpectedContent(_) => true,

            ProxyError::ConfigError(_)
            | ProxyError::IoError(_)
            | ProxyError::HttpError(_)
            | ProxyError::AllGatewaysFailed { .. }
            | ProxyError::InternalError(_) => false,
        }
    }

    /// Convert error to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::BadProtocol(_) => 400,
            ProxyError::BlockedHost(_) => 400,
            ProxyError::DisallowedHost(_) => 403,
            ProxyError::UpstreamStatus { status, .. } => *status,
            ProxyError::TooLarge { .. } => 413,
            ProxyError::Timeout { .. } => 504,
            ProxyError::UnexpectedContent(_) => 502,
            ProxyError::AllGatewaysFailed { .. } => 502,
            ProxyError::HttpError(_) => 502,
            ProxyError::ConfigError(_) => 500,
            ProxyError::IoError(_) => 500,
            ProxyError::InternalError(_) => 500,
        }
    }

    /// Label for metrics: the fetch kind, or a fixed name for other errors
    pub fn label(&self) -> &'static str {
        match self.kind() {
            Some(kind) => kind.as_str(),
            None => match self {
                ProxyError::UnexpectedContent(_) => "unexpected-content",
                ProxyError::AllGatewaysFailed { .. } => "all-gateways-failed",
                _ => "internal",
            },
        }
    }

    /// Create an UpstreamStatus error from a status code and message
    pub fn upstream_status(status: u16, message: impl Into<String>) -> Self {
        ProxyError::UpstreamStatus {
            status,
            message: message.into(),
        }
    }
}
