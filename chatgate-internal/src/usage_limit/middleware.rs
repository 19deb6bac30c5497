use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, ErrorDetails};
use crate::identity::AuthenticatedUser;
use crate::telemetry::{Severity, Telemetry};
use crate::usage_limit::{QuotaCheck, QuotaGovernor, QuotaSettings};

#[derive(Debug, Clone)]
pub struct QuotaState {
    pub governor: QuotaGovernor,
    pub settings: Arc<QuotaSettings>,
    pub telemetry: Telemetry,
}

/// Middleware for per-user quota checks.
///
/// Runs after identity and rate limiting. A successful response counts one use.
pub async fn usage_limit_middleware(
    State(state): State<QuotaState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(user) = request.extensions().get::<AuthenticatedUser>().cloned() else {
        return Err(Error::new(ErrorDetails::MissingIdentity).into_response());
    };
    let settings = &state.settings;

    let check = state
        .governor
        .check_user_quota(
            user.id(),
            &settings.feature,
            settings.daily_limit,
            settings.monthly_limit,
        )
        .await;

    if !check.allowed {
        state.telemetry.log_error(
            &format!("Usage quota exceeded for `{}`", settings.feature),
            Severity::Warning,
            serde_json::json!({
                "endpoint": request.uri().path(),
                "user_id": user.id(),
                "feature": settings.feature,
                "daily_usage": check.daily_usage,
                "daily_limit": settings.daily_limit,
                "monthly_usage": check.monthly_usage,
                "monthly_limit": settings.monthly_limit,
            }),
        );
        metrics::counter!("chatgate_quota_rejections_total", "feature" => settings.feature.clone())
            .increment(1);
        return Err(quota_exceeded_response(&check, settings));
    }
    debug!(user_id = user.id(), "Usage quota check passed");

    let response = next.run(request).await;
    if response.status().is_success() {
        let governor = state.governor.clone();
        let feature = settings.feature.clone();
        tokio::spawn(async move {
            governor.record_usage(user.id(), &feature).await;
        });
    }
    Ok(response)
}

fn quota_exceeded_response(check: &QuotaCheck, settings: &QuotaSettings) -> Response {
    let mut body = serde_json::json!({
        "error": "You have reached your usage limit. Please try again later.",
        "dailyUsage": check.daily_usage,
        "dailyLimit": settings.daily_limit,
    });
    if let (Some(usage), Some(limit)) = (check.monthly_usage, settings.monthly_limit) {
        body["monthlyUsage"] = usage.into();
        body["monthlyLimit"] = limit.into();
    }
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage_limit::store::{InMemoryUsageStore, UsageStore};
    use axum::body::Body;
    use axum::routing::post;
    use crate::store::InMemoryDataStore;
    use crate::testing::test_telemetry;
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router(store: InMemoryUsageStore, daily_limit: u64) -> Router {
        test_router_logging_to(store, daily_limit, Arc::new(InMemoryDataStore::new()))
    }

    fn test_router_logging_to(
        store: InMemoryUsageStore,
        daily_limit: u64,
        log_store: Arc<InMemoryDataStore>,
    ) -> Router {
        let state = QuotaState {
            governor: QuotaGovernor::new(Arc::new(store)),
            settings: Arc::new(QuotaSettings {
                daily_limit,
                monthly_limit: Some(100),
                ..Default::default()
            }),
            telemetry: test_telemetry(log_store),
        };
        Router::new()
            .route("/api/ai/chat", post(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                state,
                usage_limit_middleware,
            ))
    }

    fn chat_request(user: Option<&str>) -> Request {
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/ai/chat")
            .body(Body::empty())
            .unwrap();
        if let Some(user) = user {
            request
                .extensions_mut()
                .insert(AuthenticatedUser(user.to_string()));
        }
        request
    }

    #[tokio::test]
    async fn test_successful_turn_records_usage() {
        let store = InMemoryUsageStore::new();
        let app = test_router(store.clone(), 5);
        let response = app.oneshot(chat_request(Some("u1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Recording happens on a detached task
        for _ in 0..50 {
            if store.get_usage("u1", "ai_chat").await.unwrap().daily == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("usage was never recorded");
    }

    #[tokio::test]
    async fn test_exhausted_quota_is_429() {
        let store = InMemoryUsageStore::new();
        store.increment_usage("u1", "ai_chat").await.unwrap();
        let app = test_router(store, 1);

        let response = app.oneshot(chat_request(Some("u1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["dailyUsage"], 1);
        assert_eq!(body["dailyLimit"], 1);
        assert_eq!(body["monthlyUsage"], 1);
        assert_eq!(body["monthlyLimit"], 100);
    }

    #[tokio::test]
    async fn test_quota_rejection_writes_warning_entry() {
        let store = InMemoryUsageStore::new();
        store.increment_usage("u1", "ai_chat").await.unwrap();
        let log_store = Arc::new(InMemoryDataStore::new());
        let app = test_router_logging_to(store, 1, log_store.clone());

        let response = app.oneshot(chat_request(Some("u1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // The durable write runs on a detached task
        for _ in 0..50 {
            if !log_store.error_logs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let logs = log_store.error_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].severity, Severity::Warning);
        assert_eq!(logs[0].context["endpoint"], "/api/ai/chat");
        assert_eq!(logs[0].context["user_id"], "u1");
        assert_eq!(logs[0].context["daily_limit"], 1);
    }

    #[tokio::test]
    async fn test_missing_identity_is_401() {
        let app = test_router(InMemoryUsageStore::new(), 5);
        let response = app.oneshot(chat_request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
