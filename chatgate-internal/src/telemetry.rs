//! Error and activity reporting.
//!
//! Every write here is best effort: a failing sink is logged and dropped, and
//! never turns into an error for the request that triggered it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::store::{ActivityRecord, DataStore, ErrorLogRecord};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Clone)]
pub struct Telemetry {
    store: Arc<dyn DataStore>,
    http_client: reqwest::Client,
    alert_webhook: Option<Url>,
    slow_threshold: Duration,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("alerts_enabled", &self.alert_webhook.is_some())
            .field("slow_threshold", &self.slow_threshold)
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    pub fn new(
        store: Arc<dyn DataStore>,
        http_client: reqwest::Client,
        alert_webhook: Option<Url>,
        slow_threshold: Duration,
    ) -> Self {
        Self {
            store,
            http_client,
            alert_webhook,
            slow_threshold,
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Reports an error to the console, the error log table and (for
    /// `Critical`) the alert webhook. The two remote writes run independently
    /// on a detached task.
    pub fn log_error(&self, message: &str, severity: Severity, context: Value) -> JoinHandle<()> {
        match severity {
            Severity::Info => tracing::info!(%severity, %context, "{message}"),
            Severity::Warning => tracing::warn!(%severity, %context, "{message}"),
            Severity::Error | Severity::Critical => {
                tracing::error!(%severity, %context, "{message}")
            }
        }

        let record = ErrorLogRecord {
            id: Uuid::now_v7(),
            severity,
            message: message.to_string(),
            context,
            created_at: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        let alert = match (severity, &self.alert_webhook) {
            (Severity::Critical, Some(url)) => Some((self.http_client.clone(), url.clone())),
            _ => None,
        };

        tokio::spawn(async move {
            let persist = async {
                if let Err(e) = store.insert_error_log(&record).await {
                    tracing::warn!("Failed to persist error log entry: {e}");
                }
            };
            let notify = async {
                if let Some((client, url)) = alert {
                    // `Error::new` logs the failure
                    let _ = send_alert(&client, &url, &record).await;
                }
            };
            tokio::join!(persist, notify);
        })
    }

    /// Records one user action. Fire and forget.
    pub fn log_activity(
        &self,
        user_id: &str,
        action: &str,
        details: Value,
        success: bool,
    ) -> JoinHandle<()> {
        let record = ActivityRecord {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            action: action.to_string(),
            details,
            success,
            created_at: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.insert_activity_log(&record).await {
                tracing::warn!(
                    action = %record.action,
                    "Failed to persist activity log entry: {e}"
                );
            }
        })
    }

    /// Flags `elapsed` as a slow endpoint if it is over the threshold
    pub fn check_duration(&self, endpoint: &str, elapsed: Duration) -> Option<JoinHandle<()>> {
        if elapsed <= self.slow_threshold {
            return None;
        }
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        Some(self.log_error(
            &format!("Slow endpoint: {endpoint} took {duration_ms}ms"),
            Severity::Warning,
            json!({ "endpoint": endpoint, "duration_ms": duration_ms }),
        ))
    }

    /// Runs `operation` and flags it if it ran longer than the threshold
    pub async fn time_operation<F: Future>(&self, endpoint: &str, operation: F) -> F::Output {
        let start = Instant::now();
        let output = operation.await;
        self.check_duration(endpoint, start.elapsed());
        output
    }
}

async fn send_alert(
    client: &reqwest::Client,
    url: &Url,
    record: &ErrorLogRecord,
) -> Result<(), Error> {
    let payload = json!({
        "text": format!(
            "[{}] {}\n```{}```",
            record.severity.as_ref().to_uppercase(),
            record.message,
            record.context
        ),
    });
    let response = client
        .post(url.clone())
        .json(&payload)
        .send()
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::Webhook {
                message: DisplayOrDebugGateway::new(e).to_string(),
            })
        })?;
    if !response.status().is_success() {
        return Err(Error::new(ErrorDetails::Webhook {
            message: format!("webhook responded with {}", response.status()),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDataStore;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn telemetry(store: Arc<InMemoryDataStore>, webhook: Option<Url>) -> Telemetry {
        Telemetry::new(store, reqwest::Client::new(), webhook, Duration::from_secs(2))
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_error_writes_console_and_store() {
        let store = Arc::new(InMemoryDataStore::new());
        let telemetry = telemetry(store.clone(), None);
        telemetry
            .log_error(
                "AI chat failed",
                Severity::Error,
                json!({"endpoint": "/api/ai/chat", "message_length": 12}),
            )
            .await
            .unwrap();

        assert!(logs_contain("AI chat failed"));
        let logs = store.error_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].severity, Severity::Error);
        assert_eq!(logs[0].context["endpoint"], "/api/ai/chat");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_failure_is_swallowed() {
        let store = Arc::new(InMemoryDataStore::new());
        store.set_unavailable(true);
        let telemetry = telemetry(store.clone(), None);
        telemetry
            .log_error("boom", Severity::Warning, json!({}))
            .await
            .unwrap();
        telemetry
            .log_activity("u1", "ai_chat", json!({}), false)
            .await
            .unwrap();
        assert!(logs_contain("Failed to persist error log entry"));
        assert!(logs_contain("Failed to persist activity log entry"));
    }

    #[tokio::test]
    async fn test_log_activity_records_outcome() {
        let store = Arc::new(InMemoryDataStore::new());
        let telemetry = telemetry(store.clone(), None);
        telemetry
            .log_activity("u1", "ai_chat", json!({"mode": "completion"}), true)
            .await
            .unwrap();
        let activity = store.activity_logs();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].user_id, "u1");
        assert!(activity[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_is_flagged_with_duration() {
        let store = Arc::new(InMemoryDataStore::new());
        let telemetry = telemetry(store.clone(), None);
        let value = telemetry
            .time_operation("/api/ai/chat", async {
                tokio::time::sleep(Duration::from_millis(2_500)).await;
                7
            })
            .await;
        assert_eq!(value, 7);

        // The durable write runs on a detached task
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let logs = store.error_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].severity, Severity::Warning);
        assert_eq!(logs[0].context["duration_ms"], 2_500);
        assert_eq!(logs[0].context["endpoint"], "/api/ai/chat");
    }

    #[tokio::test]
    async fn test_fast_operation_is_not_flagged() {
        let store = Arc::new(InMemoryDataStore::new());
        let telemetry = telemetry(store.clone(), None);
        assert!(telemetry
            .check_duration("/api/ai/chat", Duration::from_millis(2_000))
            .is_none());
        assert!(store.error_logs().is_empty());
    }

    type Received = Arc<Mutex<Vec<Value>>>;

    async fn receive_hook(State(received): State<Received>, Json(body): Json<Value>) {
        received.lock().unwrap().push(body);
    }

    #[tokio::test]
    async fn test_critical_error_posts_webhook() {
        let received: Received = Arc::default();
        let app = Router::new()
            .route("/hook", post(receive_hook))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = Arc::new(InMemoryDataStore::new());
        let webhook = Url::parse(&format!("http://{addr}/hook")).unwrap();
        let telemetry = telemetry(store.clone(), Some(webhook));

        telemetry
            .log_error("warning only", Severity::Error, json!({}))
            .await
            .unwrap();
        telemetry
            .log_error("provider key revoked", Severity::Critical, json!({"provider": "openai"}))
            .await
            .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let text = received[0]["text"].as_str().unwrap();
        assert!(text.starts_with("[CRITICAL] provider key revoked"));
        assert_eq!(store.error_logs().len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreachable_webhook_still_persists() {
        let store = Arc::new(InMemoryDataStore::new());
        // Nothing listens on port 9 on the loopback interface
        let webhook = Url::parse("http://127.0.0.1:9/hook").unwrap();
        let telemetry = telemetry(store.clone(), Some(webhook));
        telemetry
            .log_error("db down", Severity::Critical, json!({}))
            .await
            .unwrap();
        assert_eq!(store.error_logs().len(), 1);
        assert!(logs_contain("Failed to deliver alert webhook"));
    }
}
