pub mod config;
pub mod limiter;
pub mod middleware;
pub mod resolver;
pub mod store;

pub use config::{ClientKeyStrategy, RateLimitBackend, RateLimitRule, RateLimitSettings};
pub use limiter::FixedWindowLimiter;
pub use middleware::{rate_limit_middleware, RateLimitError};
pub use resolver::RuleResolver;
pub use store::{InMemoryRateLimitStore, RateLimitStore, RedisRateLimitStore};

use axum::http::{HeaderMap, HeaderValue};
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Outcome of one `check_and_increment` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Milliseconds since the Unix epoch at which the current window closes
    pub reset_at_ms: u64,
}

impl RateLimitOutcome {
    /// Whole seconds until the window closes, never less than one
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        let remaining_ms = self.reset_at_ms.saturating_sub(now_ms);
        remaining_ms.div_ceil(1000).max(1)
    }

    pub fn headers(&self, now_ms: u64) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset_at_ms.div_ceil(1000),
            retry_after: (!self.allowed).then(|| self.retry_after_secs(now_ms)),
        }
    }
}

/// Headers returned with rate limit information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,               // Unix timestamp
    pub retry_after: Option<u64>, // Seconds
}

impl RateLimitHeaders {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Numbers always produce valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Counters for limiter activity, exposed through the status endpoint
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub checks: AtomicU64,
    pub rejections: AtomicU64,
    pub swept: AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swept(&self, count: u64) {
        self.swept.fetch_add(count, Ordering::Relaxed);
    }
}
