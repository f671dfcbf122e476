//! Hostname classification for outbound requests
//!
//! Two independent checks guard every upstream fetch: a static block list for
//! loopback and private-network hosts, and an allowlist of permitted gateway
//! hostnames. The block list only looks at the literal hostname; it does not
//! resolve DNS. [`is_blocked_ip`] is provided for callers that resolve first.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

/// Hostnames that always refer to the local machine
const LOCAL_HOSTNAMES: [&str; 4] = ["localhost", "127.0.0.1", "0.0.0.0", "::1"];

/// Whether a hostname refers to a loopback, local or private-network host
///
/// Matches `localhost`, `127.0.0.1`, `0.0.0.0`, `::1` (bare or bracketed),
/// any `*.local` name, and IPv4 literals in 10/8, 127/8, 169.254/16,
/// 192.168/16 and 172.16/12. Case-insensitive.
pub fn is_blocked_host(hostname: &str) -> bool {
    let host = hostname.to_ascii_lowercase();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&host);

    if LOCAL_HOSTNAMES.contains(&host) || host.ends_with(".local") {
        return true;
    }

    is_private_ipv4(host)
}

/// Whether a dotted-quad literal falls in a private or loopback range
fn is_private_ipv4(host: &str) -> bool {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    if !parts
        .iter()
        .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    {
        return false;
    }

    let (a, b) = match (parts[0].parse::<u64>(), parts[1].parse::<u64>()) {
        (Ok(a), Ok(b)) => (a, b),
        _ => return false,
    };

    match a {
        10 | 127 => true,
        169 => b == 254,
        192 => b == 168,
        172 => (16..=31).contains(&b),
        _ => false,
    }
}

/// Whether a resolved address points into a network the proxy must not reach
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_blocked_ipv4(v4),
            None => is_blocked_ipv6(v6),
        },
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Whether `hostname` is permitted by `allowlist`
///
/// An entry matches when it equals the lowercased hostname, when it is `*`,
/// or when it is `*.suffix` and the hostname is `suffix` or ends in `.suffix`.
/// An empty allowlist permits nothing.
pub fn is_host_allowed<S: AsRef<str>>(hostname: &str, allowlist: &[S]) -> bool {
    if allowlist.is_empty() {
        return false;
    }
    let host = hostname.to_ascii_lowercase();
    allowlist
        .iter()
        .any(|entry| host_matches(&host, entry.as_ref()))
}

fn host_matches(host: &str, entry: &str) -> bool {
    if entry == "*" {
        return true;
    }
    if let Some(suffix) = entry.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{}", suffix));
    }
    host == entry
}

/// Split a comma/whitespace separated hostname list into lowercase entries
pub fn parse_allowlist(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Merge an optional override list into the defaults
///
/// Without a usable override the lowercased defaults are returned unchanged.
/// Otherwise defaults come first, followed by new override entries, with
/// duplicates removed.
pub fn merge_allowlist<S: AsRef<str>>(defaults: &[S], overrides: Option<&str>) -> Vec<String> {
    let base: Vec<String> = defaults
        .iter()
        .map(|entry| entry.as_ref().to_ascii_lowercase())
        .collect();

    let parsed = overrides.map(parse_allowlist).unwrap_or_default();
    if parsed.is_empty() {
        return base;
    }

    let mut merged: Vec<String> = Vec::with_capacity(base.len() + parsed.len());
    for entry in base.into_iter().chain(parsed) {
        if !merged.contains(&entry) {
            merged.push(entry);
        }
    }
    merged
}

/// Build the outbound allowlist from defaults and the named environment variable
pub fn resolve_host_allowlist<S: AsRef<str>>(env_var: &str, defaults: &[S]) -> Vec<String> {
    let overrides = std::env::var(env_var).ok();
    if overrides.is_some() {
        debug!("Merging allowlist override from {}", env_var);
    }
    merge_allowlist(defaults, overrides.as_deref())
}

/// Immutable, cheaply cloned set of permitted outbound hostnames
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostAllowlist {
    entries: Arc<Vec<String>>,
}

impl HostAllowlist {
    /// Create an allowlist; entries are lowercased and deduplicated in order
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim().to_ascii_lowercase();
            if !entry.is_empty() && !normalized.contains(&entry) {
                normalized.push(entry);
            }
        }
        HostAllowlist {
            entries: Arc::new(normalized),
        }
    }

    /// Resolve from defaults plus the named environment variable
    pub fn from_env<S: AsRef<str>>(env_var: &str, defaults: &[S]) -> Self {
        HostAllowlist::new(resolve_host_allowlist(env_var, defaults))
    }

    /// Entries in priority order
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Whether the allowlist has no entries (and therefore permits nothing)
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `hostname` is permitted
    pub fn allows(&self, hostname: &str) -> bool {
        is_host_allowed(hostname, &self.entries)
    }
}
