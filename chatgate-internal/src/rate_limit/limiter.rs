use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::error::Error;
use crate::rate_limit::config::RateLimitRule;
use crate::rate_limit::store::RateLimitStore;
use crate::rate_limit::{Clock, RateLimitOutcome, RateLimiterMetrics, SystemClock};

/// Fixed-window request counting on top of a [`RateLimitStore`].
///
/// A window opens at the first request for a key and every request within
/// `window_ms` of that shares its counter. A burst straddling the boundary
/// can therefore see up to `2 * max_requests` admissions.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<RateLimiterMetrics>,
    sweep_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            metrics: Arc::new(RateLimiterMetrics::default()),
            sweep_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn metrics(&self) -> &RateLimiterMetrics {
        &self.metrics
    }

    pub fn counter_key(rule: &RateLimitRule, client_id: &str) -> String {
        format!("{}:{client_id}", rule.path)
    }

    /// Counts one request for `client_id` under `rule`.
    ///
    /// Store failures are returned to the caller, which must reject the request.
    pub async fn check_and_increment(
        &self,
        rule: &RateLimitRule,
        client_id: &str,
    ) -> Result<RateLimitOutcome, Error> {
        self.metrics.record_check();
        let key = Self::counter_key(rule, client_id);
        let now_ms = self.clock.now_ms();
        let counter = self.store.increment(&key, rule.window_ms, now_ms).await?;

        let allowed = counter.count <= rule.max_requests;
        if !allowed {
            self.metrics.record_rejection();
        }
        Ok(RateLimitOutcome {
            allowed,
            limit: rule.max_requests,
            remaining: rule.max_requests.saturating_sub(counter.count),
            reset_at_ms: counter.reset_at_ms,
        })
    }

    /// Drops expired counters once
    pub async fn sweep_expired(&self) -> Result<usize, Error> {
        let removed = self.store.sweep(self.clock.now_ms()).await?;
        self.metrics.record_swept(removed as u64);
        Ok(removed)
    }

    /// Start the periodic sweep of expired counters
    pub async fn start_background_sweep(&self, every: Duration) {
        let limiter = self.clone();
        let handle = tokio::spawn(async move {
            let mut sweep_interval = interval(every);
            loop {
                sweep_interval.tick().await;
                match limiter.sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "Swept expired rate limit counters"),
                    Err(e) => warn!("Rate limit sweep failed: {e}"),
                }
            }
        });

        if let Some(previous) = self.sweep_handle.write().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the periodic sweep
    pub async fn stop_background_sweep(&self) {
        if let Some(handle) = self.sweep_handle.write().await.take() {
            handle.abort();
        }
    }
}
