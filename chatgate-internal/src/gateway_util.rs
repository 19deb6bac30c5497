use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::{instrument, Level};
use url::Url;

use crate::config::{Config, StoreConfig};
use crate::context::ContextAssembler;
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::identity::{require_user, IdentityConfig};
use crate::providers::{
    ChatCompletionApi, DispatchSettings, ModelFamilyTable, OpenAIClient, ProviderDispatcher,
    ThreadRunApi,
};
use crate::rate_limit::middleware::RateLimitState;
use crate::rate_limit::{
    rate_limit_middleware, FixedWindowLimiter, InMemoryRateLimitStore, RateLimitBackend,
    RateLimitStore, RedisRateLimitStore, RuleResolver,
};
use crate::store::memory::DEFAULT_MAX_LOG_RECORDS;
use crate::store::{AdminSettingsCache, DataStore, InMemoryDataStore, RestDataStore};
use crate::telemetry::Telemetry;
use crate::usage_limit::{
    usage_limit_middleware, InMemoryUsageStore, QuotaGovernor, QuotaState, RedisUsageStore,
    UsageBackend, UsageStore,
};

/// State for the gateway
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub data_store: Arc<dyn DataStore>,
    pub settings_cache: AdminSettingsCache,
    pub assembler: ContextAssembler,
    pub dispatcher: ProviderDispatcher,
    pub telemetry: Telemetry,
    pub identity: IdentityConfig,
    pub rate_limit: Option<RateLimitState>,
    pub quota: Option<QuotaState>,
    pub metrics_handle: Option<PrometheusHandle>,
}
pub type AppState = axum::extract::State<AppStateData>;

/// The external systems the gateway talks to
pub struct Collaborators {
    pub data_store: Arc<dyn DataStore>,
    pub usage_store: Arc<dyn UsageStore>,
    pub rate_limit_store: Arc<dyn RateLimitStore>,
    pub threads: Arc<dyn ThreadRunApi>,
    pub completions: Arc<dyn ChatCompletionApi>,
    pub alert_webhook: Option<Url>,
}

impl AppStateData {
    /// Connects to every backend named in `config`
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let http_client = setup_http_client()?;

        let rest_store = match &config.store {
            StoreConfig::Memory => {
                tracing::warn!(
                    "No durable store configured; admin settings and documents are kept in memory, and only the newest {DEFAULT_MAX_LOG_RECORDS} log records are retained"
                );
                None
            }
            StoreConfig::Rest { url, api_key_env } => Some(Arc::new(RestDataStore::new(
                url.clone(),
                secret_from_env(api_key_env),
                http_client.clone(),
            ))),
        };
        let data_store: Arc<dyn DataStore> = match &rest_store {
            Some(store) => store.clone(),
            None => Arc::new(InMemoryDataStore::new()),
        };

        let rate_limit_store: Arc<dyn RateLimitStore> = match config.rate_limits.backend {
            RateLimitBackend::Memory => Arc::new(InMemoryRateLimitStore::new()),
            RateLimitBackend::Redis => {
                let url = redis_url(&config.rate_limits.redis_url_env)?;
                Arc::new(RedisRateLimitStore::connect(&url).await?)
            }
        };

        let usage_store: Arc<dyn UsageStore> = match config.quota.backend {
            UsageBackend::Memory => Arc::new(InMemoryUsageStore::new()),
            UsageBackend::Redis => {
                let url = redis_url(&config.rate_limits.redis_url_env)?;
                Arc::new(RedisUsageStore::connect(&url).await?)
            }
            UsageBackend::Store => match rest_store {
                Some(store) => store,
                None => {
                    return Err(Error::new(ErrorDetails::AppState {
                        message: "`quota.backend = \"store\"` requires a `rest` data store"
                            .to_string(),
                    }))
                }
            },
        };

        let provider = Arc::new(OpenAIClient::new(
            http_client.clone(),
            config.chat.api_base.clone(),
        ));
        let alert_webhook = alert_webhook_from_env(&config.telemetry.alert_webhook_url_env);

        let collaborators = Collaborators {
            data_store,
            usage_store,
            rate_limit_store,
            threads: provider.clone(),
            completions: provider,
            alert_webhook,
        };
        Self::from_collaborators(config, http_client, collaborators)
    }

    /// Wires the gateway around already-built collaborators
    pub fn from_collaborators(
        config: Arc<Config>,
        http_client: reqwest::Client,
        collaborators: Collaborators,
    ) -> Result<Self, Error> {
        let identity = IdentityConfig::new(&config.gateway.identity_header)?;
        let data_store = collaborators.data_store;
        let telemetry = Telemetry::new(
            Arc::clone(&data_store),
            http_client.clone(),
            collaborators.alert_webhook,
            config.telemetry.slow_call_threshold(),
        );

        let rate_limit = if config.rate_limits.enabled {
            Some(RateLimitState {
                resolver: RuleResolver::new(config.rate_limits.rules.clone())?,
                limiter: FixedWindowLimiter::new(collaborators.rate_limit_store),
                telemetry: telemetry.clone(),
            })
        } else {
            tracing::info!("Rate limiting is disabled in configuration");
            None
        };

        let quota = if config.quota.enabled {
            Some(QuotaState {
                governor: QuotaGovernor::new(collaborators.usage_store),
                settings: Arc::new(config.quota.clone()),
                telemetry: telemetry.clone(),
            })
        } else {
            tracing::info!("Usage quotas are disabled in configuration");
            None
        };

        let chat = &config.chat;
        let dispatcher = ProviderDispatcher::new(
            collaborators.threads,
            collaborators.completions,
            DispatchSettings {
                poll_interval: chat.poll_interval(),
                max_poll_attempts: chat.max_poll_attempts,
                history_turns: chat.history_turns,
                default_model: chat.default_model.clone(),
                default_max_tokens: chat.default_max_tokens,
                default_temperature: chat.default_temperature,
                model_families: ModelFamilyTable::with_extra(&chat.newer_model_prefixes),
            },
        );

        Ok(Self {
            settings_cache: AdminSettingsCache::new(
                Arc::clone(&data_store),
                config.gateway.settings_cache_ttl(),
            ),
            assembler: ContextAssembler::new(
                Arc::clone(&data_store),
                chat.history_turns,
                chat.private_document_char_cap,
            ),
            telemetry,
            dispatcher,
            data_store,
            identity,
            rate_limit,
            quota,
            metrics_handle: None,
            http_client,
            config,
        })
    }

    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Starts the periodic sweep of expired rate limit counters
    pub async fn start_background_tasks(&self) {
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit
                .limiter
                .start_background_sweep(self.config.rate_limits.sweep_interval())
                .await;
        }
    }

    /// Stops everything started by [`Self::start_background_tasks`]
    pub async fn stop_background_tasks(&self) {
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.limiter.stop_background_sweep().await;
        }
    }
}

/// Builds the gateway router.
///
/// Chat routes run identity first, then rate limiting, then quota. Layers
/// run in reverse order of application.
pub fn build_router(app_state: AppStateData) -> Router {
    let chat_routes = Router::new().route(
        endpoints::chat::CHAT_ENDPOINT,
        post(endpoints::chat::chat_handler),
    );

    let chat_routes = match &app_state.quota {
        Some(quota) => chat_routes.layer(axum::middleware::from_fn_with_state(
            quota.clone(),
            usage_limit_middleware,
        )),
        None => chat_routes,
    };

    let chat_routes = match &app_state.rate_limit {
        Some(rate_limit) => chat_routes.layer(axum::middleware::from_fn_with_state(
            rate_limit.clone(),
            rate_limit_middleware,
        )),
        None => chat_routes,
    };

    let chat_routes = chat_routes.layer(axum::middleware::from_fn_with_state(
        app_state.identity.clone(),
        require_user,
    ));

    Router::new()
        .merge(chat_routes)
        .route("/health", get(endpoints::status::health_handler))
        .route("/status", get(endpoints::status::status_handler))
        .route("/metrics", get(endpoints::status::metrics_handler))
        .fallback(endpoints::fallback::handle_404)
        // Failed requests are logged at DEBUG since handlers log their own errors
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state)
}

fn secret_from_env(var: &str) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(SecretString::from)
}

fn redis_url(var: &str) -> Result<String, Error> {
    std::env::var(var)
        .ok()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            Error::new(ErrorDetails::AppState {
                message: format!("Redis backend selected but `{var}` is not set"),
            })
        })
}

fn alert_webhook_from_env(var: &str) -> Option<Url> {
    let raw = std::env::var(var).ok().filter(|url| !url.trim().is_empty())?;
    match Url::parse(raw.trim()) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!("Ignoring invalid alert webhook URL in `{var}`: {e}");
            None
        }
    }
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is
/// `application/json`, and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!("{e} ({})", e.status()),
            })
        })?;

        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::InvalidRequest {
                    message: format!("{e} ({})", e.status()),
                })
            })?
            .0;

        // `serde_path_to_error` names the offending field in the message
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}

// Provider runs can poll for up to a minute, so this only guards against hung connections
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

pub fn setup_http_client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_app_state;
    use axum::body::Body;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_from_collaborators_honours_disabled_gates() {
        let mut config = Config::default();
        config.rate_limits.enabled = false;
        config.quota.enabled = false;
        let state = test_app_state(config);
        assert!(state.rate_limit.is_none());
        assert!(state.quota.is_none());
        assert!(state.metrics_handle.is_none());
    }

    #[tokio::test]
    async fn test_default_state_enables_both_gates() {
        let state = test_app_state(Config::default());
        assert!(state.rate_limit.is_some());
        assert!(state.quota.is_some());
    }

    #[tokio::test]
    async fn test_health_route() {
        let response = build_router(test_app_state(Config::default()))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = build_router(test_app_state(Config::default()))
            .oneshot(
                Request::builder()
                    .uri("/api/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_route_without_recorder() {
        let response = build_router(test_app_state(Config::default()))
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_redis_url_must_be_set() {
        let error = redis_url("CHATGATE_TEST_UNSET_REDIS_URL").unwrap_err();
        assert!(error.to_string().contains("CHATGATE_TEST_UNSET_REDIS_URL"));
    }
}
