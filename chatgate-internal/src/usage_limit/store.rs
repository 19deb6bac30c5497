use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{Clock, SystemClock};

const REDIS_KEY_PREFIX: &str = "chatgate:usage:";
const DAILY_KEY_TTL_SECS: i64 = 2 * 24 * 60 * 60;
const MONTHLY_KEY_TTL_SECS: i64 = 32 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounts {
    pub daily: u64,
    pub monthly: u64,
}

/// Persistent per-user, per-feature usage counters.
///
/// Implementations own the calendar: daily counts reset at the start of each
/// UTC day and monthly counts at the start of each UTC month.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get_usage(&self, user_id: &str, feature: &str) -> Result<UsageCounts, Error>;

    async fn increment_usage(&self, user_id: &str, feature: &str) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UsagePeriod {
    day: NaiveDate,
    year: i32,
    month: u32,
}

impl UsagePeriod {
    fn at(now_ms: u64) -> Self {
        let now = i64::try_from(now_ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default();
        Self {
            day: now.date_naive(),
            year: now.year(),
            month: now.month(),
        }
    }

    fn daily_suffix(&self) -> String {
        self.day.format("%Y-%m-%d").to_string()
    }

    fn monthly_suffix(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    period: UsagePeriod,
    daily: u64,
    monthly: u64,
}

impl UsageEntry {
    /// Counts as seen in `period`, rolling over stale day and month counts
    fn counts_at(&self, period: UsagePeriod) -> UsageCounts {
        let same_month = self.period.year == period.year && self.period.month == period.month;
        let same_day = self.period.day == period.day;
        UsageCounts {
            daily: if same_day { self.daily } else { 0 },
            monthly: if same_month { self.monthly } else { 0 },
        }
    }
}

#[derive(Clone)]
pub struct InMemoryUsageStore {
    entries: Arc<DashMap<(String, String), UsageEntry>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryUsageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryUsageStore")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryUsageStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn get_usage(&self, user_id: &str, feature: &str) -> Result<UsageCounts, Error> {
        let period = UsagePeriod::at(self.clock.now_ms());
        Ok(self
            .entries
            .get(&(user_id.to_string(), feature.to_string()))
            .map(|entry| entry.counts_at(period))
            .unwrap_or_default())
    }

    async fn increment_usage(&self, user_id: &str, feature: &str) -> Result<(), Error> {
        let period = UsagePeriod::at(self.clock.now_ms());
        let mut entry = self
            .entries
            .entry((user_id.to_string(), feature.to_string()))
            .or_insert(UsageEntry {
                period,
                daily: 0,
                monthly: 0,
            });
        let counts = entry.counts_at(period);
        *entry = UsageEntry {
            period,
            daily: counts.daily + 1,
            monthly: counts.monthly + 1,
        };
        Ok(())
    }
}

/// Usage counters in Redis, one key per user, feature and calendar period
#[derive(Clone)]
pub struct RedisUsageStore {
    conn: MultiplexedConnection,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisUsageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisUsageStore").finish_non_exhaustive()
    }
}

impl RedisUsageStore {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;
        Ok(Self {
            conn,
            clock: Arc::new(SystemClock),
        })
    }

    fn keys(&self, user_id: &str, feature: &str) -> (String, String) {
        let period = UsagePeriod::at(self.clock.now_ms());
        (
            format!("{REDIS_KEY_PREFIX}{feature}:{user_id}:d:{}", period.daily_suffix()),
            format!("{REDIS_KEY_PREFIX}{feature}:{user_id}:m:{}", period.monthly_suffix()),
        )
    }
}

fn redis_error(e: redis::RedisError) -> Error {
    Error::new(ErrorDetails::UsageStore {
        message: e.to_string(),
    })
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn get_usage(&self, user_id: &str, feature: &str) -> Result<UsageCounts, Error> {
        let (daily_key, monthly_key) = self.keys(user_id, feature);
        let mut conn = self.conn.clone();
        let (daily, monthly): (Option<u64>, Option<u64>) = redis::pipe()
            .get(&daily_key)
            .get(&monthly_key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(UsageCounts {
            daily: daily.unwrap_or(0),
            monthly: monthly.unwrap_or(0),
        })
    }

    async fn increment_usage(&self, user_id: &str, feature: &str) -> Result<(), Error> {
        let (daily_key, monthly_key) = self.keys(user_id, feature);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .incr(&daily_key, 1)
            .ignore()
            .expire(&daily_key, DAILY_KEY_TTL_SECS)
            .ignore()
            .incr(&monthly_key, 1)
            .ignore()
            .expire(&monthly_key, MONTHLY_KEY_TTL_SECS)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::ManualClock;

    // 2025-03-31T23:00:00Z
    const MARCH_31_LATE_MS: u64 = 1_743_462_000_000;
    const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

    #[tokio::test]
    async fn test_increment_counts_both_periods() {
        let store = InMemoryUsageStore::with_clock(Arc::new(ManualClock::new(MARCH_31_LATE_MS)));
        store.increment_usage("u1", "ai_chat").await.unwrap();
        store.increment_usage("u1", "ai_chat").await.unwrap();
        store.increment_usage("u1", "other").await.unwrap();

        let usage = store.get_usage("u1", "ai_chat").await.unwrap();
        assert_eq!(usage, UsageCounts { daily: 2, monthly: 2 });
        assert_eq!(
            store.get_usage("u2", "ai_chat").await.unwrap(),
            UsageCounts::default()
        );
    }

    #[tokio::test]
    async fn test_daily_resets_within_month() {
        let clock = Arc::new(ManualClock::new(MARCH_31_LATE_MS - 24 * ONE_HOUR_MS));
        let store = InMemoryUsageStore::with_clock(clock.clone());
        store.increment_usage("u1", "ai_chat").await.unwrap();

        clock.advance(24 * ONE_HOUR_MS);
        let usage = store.get_usage("u1", "ai_chat").await.unwrap();
        assert_eq!(usage, UsageCounts { daily: 0, monthly: 1 });
    }

    #[tokio::test]
    async fn test_month_rollover_resets_both() {
        let clock = Arc::new(ManualClock::new(MARCH_31_LATE_MS));
        let store = InMemoryUsageStore::with_clock(clock.clone());
        store.increment_usage("u1", "ai_chat").await.unwrap();

        clock.advance(2 * ONE_HOUR_MS);
        assert_eq!(
            store.get_usage("u1", "ai_chat").await.unwrap(),
            UsageCounts::default()
        );
        store.increment_usage("u1", "ai_chat").await.unwrap();
        assert_eq!(
            store.get_usage("u1", "ai_chat").await.unwrap(),
            UsageCounts { daily: 1, monthly: 1 }
        );
    }

    #[test]
    fn test_period_suffixes() {
        let period = UsagePeriod::at(MARCH_31_LATE_MS);
        assert_eq!(period.daily_suffix(), "2025-03-31");
        assert_eq!(period.monthly_suffix(), "2025-03");
    }
}
