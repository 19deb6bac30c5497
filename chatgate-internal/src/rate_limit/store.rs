use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::sync::Arc;

use crate::error::{Error, ErrorDetails};

const REDIS_KEY_PREFIX: &str = "chatgate:ratelimit:";

/// Current state of one fixed-window counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub count: u32,
    pub reset_at_ms: u64,
}

impl CounterSnapshot {
    fn fresh(window_ms: u64, now_ms: u64) -> Self {
        Self {
            count: 0,
            reset_at_ms: now_ms.saturating_add(window_ms),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_at_ms
    }
}

/// Storage for fixed-window counters keyed by `rule path + ":" + client`.
///
/// Expired counters must be reported as absent, whether or not they have been swept yet.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str, now_ms: u64) -> Result<Option<CounterSnapshot>, Error>;

    /// Opens a window if none is live, then counts one request in it
    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<CounterSnapshot, Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Drops expired counters and returns how many were removed
    async fn sweep(&self, now_ms: u64) -> Result<usize, Error>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryRateLimitStore {
    counters: Arc<DashMap<String, CounterSnapshot>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn get(&self, key: &str, now_ms: u64) -> Result<Option<CounterSnapshot>, Error> {
        if let Some(counter) = self.counters.get(key) {
            if !counter.is_expired(now_ms) {
                return Ok(Some(*counter));
            }
        }
        self.counters
            .remove_if(key, |_, counter| counter.is_expired(now_ms));
        Ok(None)
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<CounterSnapshot, Error> {
        // The entry guard holds the shard lock, so open-or-increment is atomic per key
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterSnapshot::fresh(window_ms, now_ms));
        if counter.is_expired(now_ms) {
            *counter = CounterSnapshot::fresh(window_ms, now_ms);
        }
        counter.count = counter.count.saturating_add(1);
        Ok(*counter)
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.counters.remove(key);
        Ok(())
    }

    async fn sweep(&self, now_ms: u64) -> Result<usize, Error> {
        let mut removed = 0;
        self.counters.retain(|_, counter| {
            let keep = !counter.is_expired(now_ms);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

/// Fixed-window counters shared between gateway replicas.
///
/// Redis owns expiry through `PEXPIRE`, so `sweep` has nothing to do.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: MultiplexedConnection,
    increment_script: Arc<Script>,
}

impl std::fmt::Debug for RedisRateLimitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimitStore").finish_non_exhaustive()
    }
}

impl RedisRateLimitStore {
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
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        let increment_script = Script::new(
            r#"
            local count = redis.call('INCR', KEYS[1])
            local ttl = redis.call('PTTL', KEYS[1])
            if count == 1 or ttl < 0 then
                redis.call('PEXPIRE', KEYS[1], ARGV[1])
                ttl = tonumber(ARGV[1])
            end
            return {count, ttl}
            "#,
        );
        Self {
            conn,
            increment_script: Arc::new(increment_script),
        }
    }

    fn redis_key(key: &str) -> String {
        format!("{REDIS_KEY_PREFIX}{key}")
    }
}

fn redis_error(e: redis::RedisError) -> Error {
    Error::new(ErrorDetails::RateLimitStore {
        message: e.to_string(),
    })
}

fn ttl_to_reset_at(now_ms: u64, ttl_ms: i64) -> u64 {
    now_ms.saturating_add(u64::try_from(ttl_ms).unwrap_or(0))
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn get(&self, key: &str, now_ms: u64) -> Result<Option<CounterSnapshot>, Error> {
        let mut conn = self.conn.clone();
        let redis_key = Self::redis_key(key);
        let (count, ttl_ms): (Option<u32>, i64) = redis::pipe()
            .get(&redis_key)
            .cmd("PTTL")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        match count {
            Some(count) if ttl_ms > 0 => Ok(Some(CounterSnapshot {
                count,
                reset_at_ms: ttl_to_reset_at(now_ms, ttl_ms),
            })),
            _ => Ok(None),
        }
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<CounterSnapshot, Error> {
        let mut conn = self.conn.clone();
        let (count, ttl_ms): (i64, i64) = self
            .increment_script
            .key(Self::redis_key(key))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(CounterSnapshot {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            reset_at_ms: ttl_to_reset_at(now_ms, ttl_ms),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(Self::redis_key(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn sweep(&self, _now_ms: u64) -> Result<usize, Error> {
        Ok(0)
    }
}
