use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use crate::gateway_util::AppStateData;

pub const CHATGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// A handler for version, build and rate limiter information
pub async fn status_handler(State(app_state): State<AppStateData>) -> Json<Value> {
    let rate_limiter = app_state.rate_limit.as_ref().map(|rate_limit| {
        let metrics = rate_limit.limiter.metrics();
        json!({
            "rules": rate_limit.resolver.rule_count(),
            "checks": metrics.checks.load(Ordering::Relaxed),
            "rejections": metrics.rejections.load(Ordering::Relaxed),
            "swept": metrics.swept.load(Ordering::Relaxed),
        })
    });
    Json(json!({
        "status": "ok",
        "version": CHATGATE_VERSION,
        "commit": crate::built_info::GIT_COMMIT_HASH_SHORT.unwrap_or("unknown"),
        "rate_limiter": rate_limiter,
    }))
}

/// Renders the Prometheus exposition, or 404 when no recorder is installed
pub async fn metrics_handler(State(app_state): State<AppStateData>) -> Response {
    match &app_state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics are not enabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_handler() {
        let Json(body) = health_handler().await;
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_status_handler_reports_version_and_limiter() {
        let state = crate::testing::test_app_state(crate::config::Config::default());
        let Json(body) = status_handler(State(state)).await;
        assert_eq!(body["version"], CHATGATE_VERSION);
        assert!(body["commit"].is_string());
        assert_eq!(body["rate_limiter"]["rules"], 3);
        assert_eq!(body["rate_limiter"]["checks"], 0);
    }

    #[tokio::test]
    async fn test_status_handler_without_rate_limiting() {
        let mut config = crate::config::Config::default();
        config.rate_limits.enabled = false;
        let state = crate::testing::test_app_state(config);
        let Json(body) = status_handler(State(state)).await;
        assert!(body["rate_limiter"].is_null());
    }
}
