//! Per-client token bucket rate limiting
//!
//! Each key (normally `ipfs:ip:<client ip>`) owns a bucket holding up to
//! `capacity` tokens, refilled continuously at `refill_per_sec`. A request
//! spends one token; a request finding less than one token is denied with the
//! number of whole seconds until a token will be available.
//!
//! Buckets live in process memory. Once more than `max_entries` keys are
//! tracked, buckets idle for longer than the TTL are dropped, and if that is
//! not enough the least recently seen buckets are evicted.

use crate::config::RateLimitConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of one rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole tokens left after this request
    pub remaining: u32,
    /// Seconds until the next token, 0 when allowed
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    fn allow(remaining: u32) -> Self {
        RateLimitDecision {
            allowed: true,
            remaining,
            retry_after_secs: 0,
        }
    }

    fn deny(retry_after_secs: u64) -> Self {
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            retry_after_secs,
        }
    }
}

/// Something that decides whether a keyed request may proceed
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check and consume one token for `key`
    async fn check(&self, key: &str) -> RateLimitDecision;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// In-memory token bucket limiter keyed by string
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_per_sec: f64,
    idle_ttl: Duration,
    max_entries: usize,
    buckets: DashMap<String, Bucket>,
}

impl TokenBucketLimiter {
    /// Create a new limiter from a validated configuration
    pub fn new(config: &RateLimitConfig) -> Self {
        TokenBucketLimiter {
            capacity: f64::from(config.capacity),
            refill_per_sec: config.refill_per_sec,
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
            max_entries: config.max_entries,
            buckets: DashMap::new(),
        }
    }

    /// Check and consume one token for `key` at the current instant
    pub fn check_now(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();

        let decision = {
            let mut entry = self.buckets.entry(key.to_string()).or_insert(Bucket {
                tokens: self.capacity,
                last_refill: now,
                last_seen: now,
            });
            let bucket = entry.value_mut();

            let elapsed = now.saturating_duration_since(bucket.last_refill);
            bucket.tokens =
                (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
            bucket.last_refill = now;
            bucket.last_seen = now;

            if bucket.tokens < 1.0 {
                RateLimitDecision::deny(self.retry_after(bucket.tokens))
            } else {
                bucket.tokens -= 1.0;
                RateLimitDecision::allow(bucket.tokens.floor() as u32)
            }
        };

        self.prune(now);

        if !decision.allowed {
            debug!(
                "Rate limit exceeded for {} (retry after {}s)",
                key, decision.retry_after_secs
            );
        }
        decision
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    fn retry_after(&self, tokens: f64) -> u64 {
        if self.refill_per_sec > 0.0 {
            ((1.0 - tokens) / self.refill_per_sec).ceil() as u64
        } else {
            0
        }
    }

    fn prune(&self, now: Instant) {
        if self.buckets.len() <= self.max_entries {
            return;
        }

        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= self.idle_ttl);

        let extra = self.buckets.len().saturating_sub(self.max_entries);
        if extra == 0 {
            return;
        }

        let mut by_age: Vec<(String, Instant)> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_seen))
            .collect();
        by_age.sort_by_key(|(_, last_seen)| *last_seen);

        for (key, _) in by_age.into_iter().take(extra) {
            self.buckets.remove(&key);
        }
        debug!("Evicted {} rate limit buckets", extra);
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn check(&self, key: &str) -> RateLimitDecision {
        self.check_now(key)
    }
}

/// Rate limit key for a client address
pub fn client_key(client_ip: &str) -> String {
    format!("ipfs:ip:{}", client_ip)
}
