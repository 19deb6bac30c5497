#![cfg(test)]

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppStateData, Collaborators};
use crate::providers::{
    ChatCompletionApi, CompletionRequest, ThreadMessage, ThreadRunApi, TurnContent,
};
use crate::rate_limit::InMemoryRateLimitStore;
use crate::store::InMemoryDataStore;
use crate::telemetry::Telemetry;
use crate::usage_limit::{InMemoryUsageStore, UsageCounts, UsageStore};

/// A usage store that is always unreachable
#[derive(Debug, Default)]
pub struct FailingUsageStore;

#[async_trait]
impl UsageStore for FailingUsageStore {
    async fn get_usage(&self, _user_id: &str, _feature: &str) -> Result<UsageCounts, Error> {
        Err(Error::new(ErrorDetails::UsageStore {
            message: "connection refused".to_string(),
        }))
    }

    async fn increment_usage(&self, _user_id: &str, _feature: &str) -> Result<(), Error> {
        Err(Error::new(ErrorDetails::UsageStore {
            message: "connection refused".to_string(),
        }))
    }
}

/// Thread/run provider that replays a fixed sequence of run statuses.
///
/// The last status repeats once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedThreads {
    statuses: Vec<String>,
    answer: Option<String>,
    status_checks: AtomicU32,
    messages_listed: AtomicU32,
    last_instructions: Mutex<Option<String>>,
    last_content: Mutex<Option<TurnContent>>,
}

impl ScriptedThreads {
    pub fn new(statuses: &[&str], answer: Option<&str>) -> Self {
        Self {
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            answer: answer.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn status_checks(&self) -> u32 {
        self.status_checks.load(Ordering::SeqCst)
    }

    pub fn messages_listed(&self) -> u32 {
        self.messages_listed.load(Ordering::SeqCst)
    }

    pub fn last_instructions(&self) -> Option<String> {
        self.last_instructions.lock().unwrap().clone()
    }

    pub fn last_content(&self) -> Option<TurnContent> {
        self.last_content.lock().unwrap().clone()
    }
}

#[async_trait]
impl ThreadRunApi for ScriptedThreads {
    async fn create_thread(
        &self,
        _credential: &SecretString,
        content: &TurnContent,
    ) -> Result<String, Error> {
        *self.last_content.lock().unwrap() = Some(content.clone());
        Ok("thread_1".to_string())
    }

    async fn create_run(
        &self,
        _credential: &SecretString,
        _thread_id: &str,
        _assistant_id: &str,
        instructions: &str,
    ) -> Result<String, Error> {
        *self.last_instructions.lock().unwrap() = Some(instructions.to_string());
        Ok("run_1".to_string())
    }

    async fn get_run_status(
        &self,
        _credential: &SecretString,
        _thread_id: &str,
        _run_id: &str,
    ) -> Result<String, Error> {
        let index = self.status_checks.fetch_add(1, Ordering::SeqCst) as usize;
        Ok(self
            .statuses
            .get(index)
            .or(self.statuses.last())
            .cloned()
            .unwrap_or_else(|| "queued".to_string()))
    }

    async fn list_messages(
        &self,
        _credential: &SecretString,
        _thread_id: &str,
    ) -> Result<Vec<ThreadMessage>, Error> {
        self.messages_listed.fetch_add(1, Ordering::SeqCst);
        let mut messages = Vec::new();
        if let Some(answer) = &self.answer {
            messages.push(ThreadMessage {
                role: "assistant".to_string(),
                text: Some(answer.clone()),
            });
        }
        messages.push(ThreadMessage {
            role: "user".to_string(),
            text: Some("question".to_string()),
        });
        Ok(messages)
    }
}

/// Completion provider with a canned answer, or a canned failure
#[derive(Debug, Default)]
pub struct ScriptedCompletions {
    answer: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletions {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatCompletionApi for ScriptedCompletions {
    async fn complete(
        &self,
        _credential: &SecretString,
        request: &CompletionRequest,
    ) -> Result<String, Error> {
        self.requests.lock().unwrap().push(request.clone());
        self.answer.clone().ok_or_else(|| {
            Error::new(ErrorDetails::ProviderRequest {
                message: "upstream unavailable".to_string(),
                status_code: Some(axum::http::StatusCode::SERVICE_UNAVAILABLE),
                raw_response: None,
            })
        })
    }
}

/// Telemetry writing to `store`, with no alert webhook
pub fn test_telemetry(store: Arc<InMemoryDataStore>) -> Telemetry {
    Telemetry::new(store, reqwest::Client::new(), None, Duration::from_secs(2))
}

/// Gateway state over in-memory stores and providers that never answer
pub fn test_app_state(config: Config) -> AppStateData {
    AppStateData::from_collaborators(
        Arc::new(config),
        reqwest::Client::new(),
        Collaborators {
            data_store: Arc::new(InMemoryDataStore::new()),
            usage_store: Arc::new(InMemoryUsageStore::new()),
            rate_limit_store: Arc::new(InMemoryRateLimitStore::new()),
            threads: Arc::new(ScriptedThreads::default()),
            completions: Arc::new(ScriptedCompletions::default()),
            alert_webhook: None,
        },
    )
    .unwrap()
}
