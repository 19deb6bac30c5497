pub mod governor;
pub mod middleware;
pub mod store;

pub use governor::QuotaGovernor;
pub use middleware::{usage_limit_middleware, QuotaState};
pub use store::{InMemoryUsageStore, RedisUsageStore, UsageCounts, UsageStore};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageBackend {
    #[default]
    Memory,
    Redis,
    /// The durable data store (`usage_tracking` table)
    Store,
}

/// Per-user quota policy for one feature
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: UsageBackend,
    #[serde(default = "default_feature")]
    pub feature: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

fn default_feature() -> String {
    "ai_chat".to_string()
}

fn default_daily_limit() -> u64 {
    50
}

fn default_monthly_limit() -> Option<u64> {
    Some(1000)
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: UsageBackend::default(),
            feature: default_feature(),
            daily_limit: default_daily_limit(),
            monthly_limit: default_monthly_limit(),
        }
    }
}

impl QuotaSettings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.feature.trim().is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "`quota.feature` must not be empty".to_string(),
            }));
        }
        Ok(())
    }
}

/// Result of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCheck {
    pub allowed: bool,
    pub daily_usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_usage: Option<u64>,
}
