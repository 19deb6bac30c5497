//! AI provider access for chat turns.
//!
//! Two provider workflows are modelled as traits so the dispatcher can be
//! driven by scripted providers in tests:
//! - [`ThreadRunApi`]: stateful thread + run, polled until the run settles
//! - [`ChatCompletionApi`]: a single stateless completion call

pub mod dispatcher;
pub mod model_family;
pub mod openai;
pub mod run_state;

pub use dispatcher::{DispatchMode, DispatchSettings, ProviderDispatcher, TurnRequest};
pub use model_family::{ModelFamilyTable, RequestShape};
pub use openai::OpenAIClient;
pub use run_state::{ProviderSession, RunState};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::store::AdminSettings;

/// The user's side of a turn: text plus any attached image URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnContent {
    pub text: String,
    pub image_urls: Vec<String>,
}

impl TurnContent {
    pub fn new(text: impl Into<String>, image_urls: Vec<String>) -> Self {
        Self {
            text: text.into(),
            image_urls,
        }
    }

    /// Renders as a plain string when there are no images, otherwise as content parts
    pub fn to_message_content(&self) -> MessageContent {
        if self.image_urls.is_empty() {
            return MessageContent::Text(self.text.clone());
        }
        let mut parts = Vec::with_capacity(self.image_urls.len() + 1);
        parts.push(ContentPart::Text {
            text: self.text.clone(),
        });
        parts.extend(self.image_urls.iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.clone() },
        }));
        MessageContent::Parts(parts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// The text portion of the content
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(parts) => parts.iter().find_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }
}

/// A stateless completion request. Exactly one of the two size parameters is set,
/// depending on the model's [`RequestShape`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// A message read back from a provider thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub role: String,
    /// Text of the first content block, if it is a text block
    pub text: Option<String>,
}

#[async_trait]
pub trait ThreadRunApi: Send + Sync {
    /// Creates a thread seeded with the user's turn and returns its id
    async fn create_thread(
        &self,
        credential: &SecretString,
        content: &TurnContent,
    ) -> Result<String, Error>;

    /// Starts a run of `assistant_id` on the thread and returns the run id
    async fn create_run(
        &self,
        credential: &SecretString,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
    ) -> Result<String, Error>;

    /// Returns the provider's raw status string for the run
    async fn get_run_status(
        &self,
        credential: &SecretString,
        thread_id: &str,
        run_id: &str,
    ) -> Result<String, Error>;

    /// Lists thread messages, newest first
    async fn list_messages(
        &self,
        credential: &SecretString,
        thread_id: &str,
    ) -> Result<Vec<ThreadMessage>, Error>;
}

#[async_trait]
pub trait ChatCompletionApi: Send + Sync {
    /// Returns the text of the first choice
    async fn complete(
        &self,
        credential: &SecretString,
        request: &CompletionRequest,
    ) -> Result<String, Error>;
}

/// The admin-configured key if there is one, else the named environment variable
pub fn resolve_credential(settings: &AdminSettings, env_var: &str) -> Option<SecretString> {
    if let Some(key) = &settings.api_key {
        return Some(SecretString::from(key.expose_secret().to_string()));
    }
    std::env::var(env_var)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .map(SecretString::from)
}
