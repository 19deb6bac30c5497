use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::identity::DEFAULT_IDENTITY_HEADER;
use crate::rate_limit::RateLimitSettings;
use crate::usage_limit::QuotaSettings;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    #[serde(default)]
    pub quota: QuotaSettings,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    /// Trusted header carrying the signed-in user id
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
    #[serde(default = "default_settings_cache_ttl_ms")]
    pub settings_cache_ttl_ms: u64,
}

fn default_identity_header() -> String {
    DEFAULT_IDENTITY_HEADER.to_string()
}

fn default_settings_cache_ttl_ms() -> u64 {
    30_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            debug: false,
            identity_header: default_identity_header(),
            settings_cache_ttl_ms: default_settings_cache_ttl_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn settings_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.settings_cache_ttl_ms)
    }
}

/// AI turn settings. Admin settings in the data store override the model,
/// prompt and credential at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChatConfig {
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_private_document_char_cap")]
    pub private_document_char_cap: usize,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_api_base")]
    pub api_base: Url,
    /// Environment variable consulted when the admin settings carry no key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Extra model-name fragments that take the newer request shape
    #[serde(default)]
    pub newer_model_prefixes: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
}

fn default_history_turns() -> usize {
    10
}

fn default_private_document_char_cap() -> usize {
    30_000
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_poll_attempts() -> u32 {
    30
}

#[expect(clippy::expect_used)]
fn default_api_base() -> Url {
    Url::parse("https://api.openai.com/v1/").expect("default provider URL is valid")
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    1_000
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            private_document_char_cap: default_private_document_char_cap(),
            default_model: default_model(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            newer_model_prefixes: Vec::new(),
            default_max_tokens: default_max_tokens(),
            default_temperature: default_temperature(),
        }
    }
}

impl ChatConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_poll_attempts == 0 {
            return Err(config_error("`chat.max_poll_attempts` must be greater than 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(config_error("`chat.poll_interval_ms` must be greater than 0"));
        }
        if self.private_document_char_cap == 0 {
            return Err(config_error(
                "`chat.private_document_char_cap` must be greater than 0",
            ));
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(config_error("`chat.default_temperature` must be within 0.0..=2.0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StoreConfig {
    #[default]
    Memory,
    /// PostgREST endpoint in front of the hosted database
    Rest {
        url: Url,
        #[serde(default = "default_store_api_key_env")]
        api_key_env: String,
    },
}

fn default_store_api_key_env() -> String {
    "CHATGATE_STORE_API_KEY".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default = "default_slow_call_threshold_ms")]
    pub slow_call_threshold_ms: u64,
    /// Environment variable holding the Slack-compatible alert webhook URL
    #[serde(default = "default_alert_webhook_url_env")]
    pub alert_webhook_url_env: String,
}

fn default_slow_call_threshold_ms() -> u64 {
    2_000
}

fn default_alert_webhook_url_env() -> String {
    "SLACK_WEBHOOK_URL".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            slow_call_threshold_ms: default_slow_call_threshold_ms(),
            alert_webhook_url_env: default_alert_webhook_url_env(),
        }
    }
}

impl TelemetryConfig {
    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }
}

fn config_error(message: &str) -> Error {
    Error::new(ErrorDetails::Config {
        message: message.to_string(),
    })
}

impl Config {
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::load_from_str(&contents)?;
        tracing::info!(
            rules = config.rate_limits.rules.len(),
            "Loaded config from `{}`",
            path.display()
        );
        Ok(config)
    }

    pub fn load_from_str(contents: &str) -> Result<Config, Error> {
        let config: Config = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.rate_limits.validate()?;
        // Compiles every wildcard so a bad pattern fails at load time
        crate::rate_limit::RuleResolver::new(self.rate_limits.rules.clone())?;
        self.quota.validate()?;
        if self.quota.backend == crate::usage_limit::UsageBackend::Store
            && matches!(self.store, StoreConfig::Memory)
        {
            return Err(config_error(
                "`quota.backend = \"store\"` requires `[store] type = \"rest\"`",
            ));
        }
        self.chat.validate()?;
        crate::identity::IdentityConfig::new(&self.gateway.identity_header)?;
        Ok(())
    }
}
