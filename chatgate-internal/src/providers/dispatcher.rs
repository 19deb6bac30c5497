use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::context::{recent_history, ConversationContext, TurnMessage};
use crate::error::{Error, ErrorDetails};
use crate::providers::model_family::{ModelFamilyTable, RequestShape};
use crate::providers::run_state::{ProviderSession, RunState};
use crate::providers::{
    ChatCompletionApi, ChatMessage, CompletionRequest, ThreadRunApi, TurnContent,
};
use crate::store::AdminSettings;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub history_turns: usize,
    pub default_model: String,
    pub default_max_tokens: u32,
    pub default_temperature: f32,
    pub model_families: ModelFamilyTable,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_poll_attempts: 30,
            history_turns: 10,
            default_model: "gpt-4o-mini".to_string(),
            default_max_tokens: 1_000,
            default_temperature: 0.7,
            model_families: ModelFamilyTable::default(),
        }
    }
}

/// Which provider workflow serves a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchMode {
    ThreadRun { assistant_id: String },
    Completion { model: String },
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::ThreadRun { .. } => "thread_run",
            DispatchMode::Completion { .. } => "completion",
        }
    }
}

/// Inputs for one dispatched turn
#[derive(Debug)]
pub struct TurnRequest<'a> {
    pub context: &'a ConversationContext,
    pub history: &'a [TurnMessage],
    pub image_urls: &'a [String],
    pub settings: &'a AdminSettings,
    pub credential: &'a SecretString,
}

#[derive(Clone)]
pub struct ProviderDispatcher {
    threads: Arc<dyn ThreadRunApi>,
    completions: Arc<dyn ChatCompletionApi>,
    settings: DispatchSettings,
}

impl std::fmt::Debug for ProviderDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDispatcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ProviderDispatcher {
    pub fn new(
        threads: Arc<dyn ThreadRunApi>,
        completions: Arc<dyn ChatCompletionApi>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            threads,
            completions,
            settings,
        }
    }

    /// A configured assistant selects the stateful workflow
    pub fn mode_for(&self, settings: &AdminSettings) -> DispatchMode {
        match settings.assistant_id() {
            Some(assistant_id) => DispatchMode::ThreadRun {
                assistant_id: assistant_id.to_string(),
            },
            None => DispatchMode::Completion {
                model: settings
                    .model
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or(&self.settings.default_model)
                    .to_string(),
            },
        }
    }

    /// Runs the turn and returns the provider's raw answer text
    pub async fn execute(&self, turn: &TurnRequest<'_>) -> Result<String, Error> {
        match self.mode_for(turn.settings) {
            DispatchMode::ThreadRun { assistant_id } => {
                self.run_thread(turn, &assistant_id).await
            }
            DispatchMode::Completion { model } => {
                let request = self.build_completion_request(turn, &model);
                self.completions.complete(turn.credential, &request).await
            }
        }
    }

    #[instrument(skip_all, fields(assistant_id = %assistant_id))]
    async fn run_thread(
        &self,
        turn: &TurnRequest<'_>,
        assistant_id: &str,
    ) -> Result<String, Error> {
        let content = TurnContent::new(turn.context.turn_input.clone(), turn.image_urls.to_vec());
        let thread_id = self.threads.create_thread(turn.credential, &content).await?;
        let run_id = self
            .threads
            .create_run(
                turn.credential,
                &thread_id,
                assistant_id,
                &turn.context.instructions(),
            )
            .await?;
        let mut session = ProviderSession::new(thread_id, run_id);
        self.poll_until_settled(turn.credential, &mut session).await?;

        let messages = self
            .threads
            .list_messages(turn.credential, &session.thread_id)
            .await?;
        messages
            .into_iter()
            .find(|message| message.role == "assistant")
            .and_then(|message| message.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                Error::new(ErrorDetails::NoAssistantAnswer {
                    thread_id: session.thread_id.clone(),
                })
            })
    }

    /// Polls the run at a fixed interval until it completes, fails or runs out of attempts
    async fn poll_until_settled(
        &self,
        credential: &SecretString,
        session: &mut ProviderSession,
    ) -> Result<(), Error> {
        let max_attempts = self.settings.max_poll_attempts;
        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;
            let status = self
                .threads
                .get_run_status(credential, &session.thread_id, &session.run_id)
                .await?;
            let state = session.observe(&status, attempt, max_attempts);
            debug!(run_id = %session.run_id, attempt, %status, "Polled provider run");
            match state {
                RunState::Completed => return Ok(()),
                RunState::Failed => {
                    return Err(Error::new(ErrorDetails::ProviderRunFailed {
                        run_id: session.run_id.clone(),
                        status,
                    }))
                }
                RunState::Timeout => break,
                RunState::Created | RunState::Queued | RunState::InProgress => {}
            }
        }
        session.status = RunState::Timeout;
        Err(Error::new(ErrorDetails::ProviderRunTimeout {
            run_id: session.run_id.clone(),
            attempts: max_attempts,
        }))
    }

    /// System message, the last history turns, then the current turn
    pub fn build_completion_request(
        &self,
        turn: &TurnRequest<'_>,
        model: &str,
    ) -> CompletionRequest {
        let mut system = turn.context.instructions();
        if !turn.image_urls.is_empty() {
            system.push_str(&format!(
                "\n\nThe user attached {} image(s) to this message. Describe or use them when they are relevant to the answer.",
                turn.image_urls.len()
            ));
        }

        let history = recent_history(turn.history, self.settings.history_turns);
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::text("system", system));
        messages.extend(
            history
                .iter()
                .map(|m| ChatMessage::text(m.role.clone(), m.content.clone())),
        );
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: TurnContent::new(turn.context.turn_input.clone(), turn.image_urls.to_vec())
                .to_message_content(),
        });

        let max_tokens = turn
            .settings
            .max_tokens
            .unwrap_or(self.settings.default_max_tokens);
        match self.settings.model_families.shape_for(model) {
            RequestShape::Newer => CompletionRequest {
                model: model.to_string(),
                messages,
                max_completion_tokens: Some(max_tokens),
                max_tokens: None,
                temperature: None,
            },
            RequestShape::Legacy => CompletionRequest {
                model: model.to_string(),
                messages,
                max_completion_tokens: None,
                max_tokens: Some(max_tokens),
                temperature: Some(
                    turn.settings
                        .temperature
                        .unwrap_or(self.settings.default_temperature),
                ),
            },
        }
    }
}
