use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

/// How the client half of a counter key is derived for a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKeyStrategy {
    /// Authenticated user, then forwarded-for, then peer address
    #[default]
    Client,
    /// Network address only, even for signed-in users
    Ip,
}

/// A single rate limit rule. Rules are immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitRule {
    /// Path prefix, or a pattern where `*` matches any run of characters
    pub path: String,
    pub window_ms: u64,
    pub max_requests: u32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub key: ClientKeyStrategy,
}

impl RateLimitRule {
    pub fn new(path: impl Into<String>, window_ms: u64, max_requests: u32) -> Self {
        Self {
            path: path.into(),
            window_ms,
            max_requests,
            message: None,
            key: ClientKeyStrategy::default(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_key(mut self, key: ClientKeyStrategy) -> Self {
        self.key = key;
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.path.contains('*')
    }

    pub fn rejection_message(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or("Too many requests, please try again later.")
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.path.is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "Rate limit rule has an empty `path`".to_string(),
            }));
        }
        if self.window_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("Rate limit rule `{}` must have `window_ms > 0`", self.path),
            }));
        }
        if self.max_requests == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "Rate limit rule `{}` must have `max_requests >= 1`",
                    self.path
                ),
            }));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub backend: RateLimitBackend,

    /// Environment variable holding the Redis URL when `backend = "redis"`
    #[serde(default = "default_redis_url_env")]
    pub redis_url_env: String,

    /// How often expired in-memory counters are swept
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_rules")]
    pub rules: Vec<RateLimitRule>,
}

fn default_enabled() -> bool {
    true
}

fn default_redis_url_env() -> String {
    "CHATGATE_REDIS_URL".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

pub fn default_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule::new("/api/ai/*", 60_000, 20)
            .with_message("Too many AI requests. Please wait a minute before trying again."),
        RateLimitRule::new("/api/auth/login", 15 * 60_000, 5)
            .with_message("Too many login attempts. Please try again in 15 minutes.")
            .with_key(ClientKeyStrategy::Ip),
        RateLimitRule::new("/api/contact", 60 * 60_000, 5)
            .with_message("Too many submissions. Please try again later.")
            .with_key(ClientKeyStrategy::Ip),
    ]
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: RateLimitBackend::default(),
            redis_url_env: default_redis_url_env(),
            sweep_interval_ms: default_sweep_interval_ms(),
            rules: default_rules(),
        }
    }
}

impl RateLimitSettings {
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.sweep_interval_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`rate_limits.sweep_interval_ms` must be greater than 0".to_string(),
            }));
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}
