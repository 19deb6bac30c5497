use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use tracing::debug;

use crate::error::Error;
use crate::identity::AuthenticatedUser;
use crate::rate_limit::config::ClientKeyStrategy;
use crate::rate_limit::{FixedWindowLimiter, RateLimitHeaders, RuleResolver};
use crate::telemetry::{Severity, Telemetry};

pub const UNKNOWN_CLIENT: &str = "unknown";

/// Everything the rate limit middleware needs
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub resolver: RuleResolver,
    pub limiter: FixedWindowLimiter,
    pub telemetry: Telemetry,
}

/// Who a request is counted against.
///
/// Falls back through authenticated user, first `X-Forwarded-For` address and
/// peer address; with nothing to go on every such request shares `"unknown"`.
pub fn resolve_client_id(request: &Request, strategy: ClientKeyStrategy) -> String {
    if strategy == ClientKeyStrategy::Client {
        if let Some(user) = request.extensions().get::<AuthenticatedUser>() {
            return format!("user:{}", user.id());
        }
    }

    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    UNKNOWN_CLIENT.to_string()
}

/// Rate limiting middleware for rule-governed paths.
///
/// Paths without a rule pass straight through. A store failure rejects the request.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, RateLimitError> {
    let path = request.uri().path().to_string();
    let Some(rule) = state.resolver.resolve(&path) else {
        return Ok(next.run(request).await);
    };

    let client_id = resolve_client_id(&request, rule.key);
    let outcome = state
        .limiter
        .check_and_increment(&rule, &client_id)
        .await
        .map_err(RateLimitError::StoreUnavailable)?;
    let headers = outcome.headers(state.limiter.now_ms());

    if outcome.allowed {
        debug!(
            rule = %rule.path,
            client = %client_id,
            remaining = outcome.remaining,
            "Rate limit check passed"
        );
        let mut response = next.run(request).await;
        response.headers_mut().extend(headers.to_header_map());
        return Ok(response);
    }

    state.telemetry.log_error(
        &format!("Rate limit exceeded for {path}"),
        Severity::Warning,
        serde_json::json!({
            "endpoint": path,
            "rule": rule.path,
            "client": client_id,
            "limit": outcome.limit,
            "reset": headers.reset,
        }),
    );
    metrics::counter!("chatgate_rate_limit_rejections_total", "rule" => rule.path.clone())
        .increment(1);
    Err(RateLimitError::Exceeded {
        message: rule.rejection_message().to_string(),
        headers,
    })
}

#[derive(Debug)]
pub enum RateLimitError {
    Exceeded {
        message: String,
        headers: RateLimitHeaders,
    },
    StoreUnavailable(Error),
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        match self {
            RateLimitError::Exceeded { message, headers } => {
                let retry_after = headers.retry_after.unwrap_or(1);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({
                        "error": message,
                        "retryAfter": retry_after,
                    })),
                )
                    .into_response();
                response.headers_mut().extend(headers.to_header_map());
                response
            }
            RateLimitError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "Rate limiting is temporarily unavailable. Please try again shortly."
                })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::config::RateLimitRule;
    use crate::rate_limit::store::{CounterSnapshot, InMemoryRateLimitStore, RateLimitStore};
    use crate::rate_limit::ManualClock;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use crate::store::InMemoryDataStore;
    use crate::testing::test_telemetry;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_router(rules: Vec<RateLimitRule>, store: Arc<dyn RateLimitStore>) -> Router {
        test_router_logging_to(rules, store, Arc::new(InMemoryDataStore::new()))
    }

    fn test_router_logging_to(
        rules: Vec<RateLimitRule>,
        store: Arc<dyn RateLimitStore>,
        log_store: Arc<InMemoryDataStore>,
    ) -> Router {
        let state = RateLimitState {
            resolver: RuleResolver::new(rules).unwrap(),
            limiter: FixedWindowLimiter::with_clock(store, Arc::new(ManualClock::new(10_000))),
            telemetry: test_telemetry(log_store),
        };
        Router::new()
            .route("/api/contact", get(|| async { "ok" }))
            .route("/health", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                state,
                rate_limit_middleware,
            ))
    }

    fn get_request(uri: &str, forwarded_for: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(ip) = forwarded_for {
            builder = builder.header("x-forwarded-for", ip);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_response_carries_headers() {
        let app = test_router(
            vec![RateLimitRule::new("/api/contact", 60_000, 2)],
            Arc::new(InMemoryRateLimitStore::new()),
        );
        let response = app
            .oneshot(get_request("/api/contact", Some("1.2.3.4")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "2");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "1");
        assert_eq!(response.headers()["X-RateLimit-Reset"], "70");
        assert!(!response.headers().contains_key("Retry-After"));
    }

    #[tokio::test]
    async fn test_rejection_is_429_with_message_and_retry_after() {
        let app = test_router(
            vec![RateLimitRule::new("/api/contact", 60_000, 1).with_message("Slow down")],
            Arc::new(InMemoryRateLimitStore::new()),
        );
        let first = app
            .clone()
            .oneshot(get_request("/api/contact", Some("1.2.3.4")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(get_request("/api/contact", Some("1.2.3.4")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["Retry-After"], "60");
        let body = axum::body::to_bytes(second.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Slow down");
        assert_eq!(body["retryAfter"], 60);
    }

    #[tokio::test]
    async fn test_each_rejection_writes_one_warning_entry() {
        let log_store = Arc::new(InMemoryDataStore::new());
        let app = test_router_logging_to(
            vec![RateLimitRule::new("/api/contact", 60_000, 1)],
            Arc::new(InMemoryRateLimitStore::new()),
            log_store.clone(),
        );
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(get_request("/api/contact", Some("1.2.3.4")))
                .await
                .unwrap();
            statuses.push(response.status());
        }
        assert_eq!(
            statuses,
            vec![
                StatusCode::OK,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS
            ]
        );

        // The durable write runs on a detached task
        for _ in 0..50 {
            if log_store.error_logs().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let logs = log_store.error_logs();
        assert_eq!(logs.len(), 2);
        for entry in &logs {
            assert_eq!(entry.severity, Severity::Warning);
            assert_eq!(entry.context["endpoint"], "/api/contact");
            assert_eq!(entry.context["client"], "1.2.3.4");
            assert_eq!(entry.context["limit"], 1);
            assert_eq!(entry.context["reset"], 70);
        }
    }

    #[tokio::test]
    async fn test_forwarded_for_uses_first_address() {
        let app = test_router(
            vec![RateLimitRule::new("/api/contact", 60_000, 1)],
            Arc::new(InMemoryRateLimitStore::new()),
        );
        let first = app
            .clone()
            .oneshot(get_request("/api/contact", Some("5.5.5.5, 10.0.0.1")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        // Same originating client behind a different proxy chain
        let second = app
            .clone()
            .oneshot(get_request("/api/contact", Some("5.5.5.5, 10.0.0.2")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let other = app
            .oneshot(get_request("/api/contact", Some("6.6.6.6")))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ungoverned_path_passes_through() {
        let app = test_router(
            vec![RateLimitRule::new("/api/contact", 60_000, 1)],
            Arc::new(InMemoryRateLimitStore::new()),
        );
        for _ in 0..3 {
            let response = app.clone().oneshot(get_request("/health", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("X-RateLimit-Limit"));
        }
    }

    #[test]
    fn test_client_id_prefers_authenticated_user() {
        let mut request = get_request("/api/ai/chat", Some("1.2.3.4"));
        request
            .extensions_mut()
            .insert(AuthenticatedUser("u-1".to_string()));
        assert_eq!(
            resolve_client_id(&request, ClientKeyStrategy::Client),
            "user:u-1"
        );
        assert_eq!(resolve_client_id(&request, ClientKeyStrategy::Ip), "1.2.3.4");
    }

    #[test]
    fn test_client_id_falls_back_to_peer_then_unknown() {
        let mut request = get_request("/api/contact", None);
        assert_eq!(
            resolve_client_id(&request, ClientKeyStrategy::Client),
            UNKNOWN_CLIENT
        );
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 7], 5000))));
        assert_eq!(
            resolve_client_id(&request, ClientKeyStrategy::Client),
            "192.168.1.7"
        );
    }

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn get(&self, _key: &str, _now_ms: u64) -> Result<Option<CounterSnapshot>, Error> {
            Ok(None)
        }

        async fn increment(
            &self,
            _key: &str,
            _window_ms: u64,
            _now_ms: u64,
        ) -> Result<CounterSnapshot, Error> {
            Err(Error::new(crate::error::ErrorDetails::RateLimitStore {
                message: "connection refused".to_string(),
            }))
        }

        async fn delete(&self, _key: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn sweep(&self, _now_ms: u64) -> Result<usize, Error> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let app = test_router(
            vec![RateLimitRule::new("/api/contact", 60_000, 100)],
            Arc::new(BrokenStore),
        );
        let response = app
            .oneshot(get_request("/api/contact", Some("1.2.3.4")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
