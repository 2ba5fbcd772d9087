// Per-client-IP rate limiting for the public endpoints
//
// One token bucket per (client ip, rule prefix). The first rule whose prefix
// matches the request path applies; paths without a rule are not limited.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// `per_minute` requests per client under `prefix`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    pub prefix: String,
    pub per_minute: u64,
}

impl RateLimitRule {
    pub fn new(prefix: &str, per_minute: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            per_minute,
        }
    }
}

pub fn default_rate_limit_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule::new("/register", 10),
        RateLimitRule::new("/token", 20),
        RateLimitRule::new("/authorize", 20),
        RateLimitRule::new("/consent", 20),
        RateLimitRule::new("/api/actions", 120),
    ]
}

/// Token bucket for a single (client, rule) pair.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Refills based on elapsed time at rate = capacity/60 tokens/sec.
    fn try_consume(&mut self, capacity: u64) -> bool {
        self.refill(capacity, Instant::now());

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, capacity: u64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refill_rate = capacity as f64 / 60.0;
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity as f64);
        self.last_refill = now;
    }

    /// Full again, so forgetting it changes nothing.
    fn is_full(&self, capacity: u64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * capacity as f64 / 60.0 >= capacity as f64
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BucketKey {
    ip: IpAddr,
    rule: usize,
}

/// Per-client token bucket rate limiter.
///
/// Buckets are created lazily on first request. State is in-memory only (resets on restart).
pub struct RateLimiter {
    rules: Vec<RateLimitRule>,
    buckets: DashMap<BucketKey, TokenBucket>,
    max_clients: usize,
}

impl RateLimiter {
    pub fn new(rules: Vec<RateLimitRule>, max_clients: usize) -> Self {
        Self {
            rules,
            buckets: DashMap::new(),
            max_clients: max_clients.max(1),
        }
    }

    fn rule_for(&self, path: &str) -> Option<usize> {
        self.rules.iter().position(|r| path.starts_with(&r.prefix))
    }

    /// Check and consume one token for `ip` on `path`.
    ///
    /// Returns true if the request is allowed, false if rate limit exceeded.
    pub fn check_and_consume(&self, ip: IpAddr, path: &str) -> bool {
        let Some(rule) = self.rule_for(path) else {
            return true;
        };
        let capacity = self.rules[rule].per_minute;
        let key = BucketKey { ip, rule };

        if !self.buckets.contains_key(&key) && self.buckets.len() >= self.max_clients {
            self.make_room();
        }

        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(capacity));
        bucket.try_consume(capacity)
    }

    /// Drop refilled buckets; if none were, drop the least recently used one.
    fn make_room(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|key, bucket| !bucket.is_full(self.rules[key.rule].per_minute, now));

        if self.buckets.len() < self.max_clients {
            return;
        }

        let oldest = self
            .buckets
            .iter()
            .min_by_key(|entry| entry.value().last_refill)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.buckets.remove(&key);
        }
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

/// axum middleware; the client address comes from `ConnectInfo`.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if !limiter.check_and_consume(ip, request.uri().path()) {
        warn!(client_ip = %ip, path = %request.uri().path(), "Rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "60")],
            Json(json!({
                "error": "rate_limited",
                "error_description": "Too many requests, retry later",
            })),
        )
            .into_response();
    }

    next.run(request).await
}
