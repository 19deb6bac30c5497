use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::providers::{
    ChatCompletionApi, CompletionRequest, MessageContent, ThreadMessage, ThreadRunApi, TurnContent,
};

const ASSISTANTS_BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

/// OpenAI-compatible REST client for both provider workflows
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    http_client: reqwest::Client,
    api_base: Url,
}

#[derive(Debug, Serialize)]
struct CreateThreadRequest<'a> {
    messages: [ThreadSeedMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ThreadSeedMessage<'a> {
    role: &'a str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
    instructions: &'a str,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    data: Vec<ThreadMessageResponse>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessageResponse {
    role: String,
    #[serde(default)]
    content: Vec<ThreadContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ThreadContentBlock {
    Text {
        text: ThreadText,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ThreadText {
    value: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

impl From<ThreadMessageResponse> for ThreadMessage {
    fn from(message: ThreadMessageResponse) -> Self {
        let text = match message.content.into_iter().next() {
            Some(ThreadContentBlock::Text { text }) => Some(text.value),
            _ => None,
        };
        ThreadMessage {
            role: message.role,
            text,
        }
    }
}

impl OpenAIClient {
    pub fn new(http_client: reqwest::Client, api_base: Url) -> Self {
        let mut api_base = api_base;
        if !api_base.path().ends_with('/') {
            api_base.set_path(&format!("{}/", api_base.path()));
        }
        Self {
            http_client,
            api_base,
        }
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.api_base.join(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid provider URL for `{path}`: {e}"),
            })
        })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        credential: &SecretString,
    ) -> Result<RequestBuilder, Error> {
        Ok(self
            .http_client
            .request(method, self.url(path)?)
            .bearer_auth(credential.expose_secret()))
    }

    fn thread_request(
        &self,
        method: Method,
        path: &str,
        credential: &SecretString,
    ) -> Result<RequestBuilder, Error> {
        let (name, value) = ASSISTANTS_BETA_HEADER;
        Ok(self.request(method, path, credential)?.header(name, value))
    }
}

async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, Error> {
    let response = builder.send().await.map_err(|e| {
        let status_code = e.status();
        Error::new(ErrorDetails::ProviderRequest {
            message: format!("Error sending request: {}", DisplayOrDebugGateway::new(e)),
            status_code,
            raw_response: None,
        })
    })?;
    let status = response.status();
    let raw_response = response.text().await.map_err(|e| {
        Error::new(ErrorDetails::ProviderRequest {
            message: format!("Error reading response: {}", DisplayOrDebugGateway::new(e)),
            status_code: Some(status),
            raw_response: None,
        })
    })?;
    if !status.is_success() {
        return Err(handle_provider_error(status, &raw_response));
    }
    serde_json::from_str(&raw_response).map_err(|e| {
        Error::new(ErrorDetails::ProviderRequest {
            message: format!("Error parsing response: {}", DisplayOrDebugGateway::new(e)),
            status_code: Some(status),
            raw_response: Some(raw_response.clone()),
        })
    })
}

fn handle_provider_error(status: StatusCode, raw_response: &str) -> Error {
    // OpenAI-style bodies carry `{"error": {"message": ...}}`
    let message = serde_json::from_str::<serde_json::Value>(raw_response)
        .ok()
        .and_then(|body| {
            body.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "provider returned an error".to_string());
    Error::new(ErrorDetails::ProviderRequest {
        message,
        status_code: Some(status),
        raw_response: Some(raw_response.to_string()),
    })
}

#[async_trait]
impl ThreadRunApi for OpenAIClient {
    async fn create_thread(
        &self,
        credential: &SecretString,
        content: &TurnContent,
    ) -> Result<String, Error> {
        let body = CreateThreadRequest {
            messages: [ThreadSeedMessage {
                role: "user",
                content: content.to_message_content(),
            }],
        };
        let builder = self
            .thread_request(Method::POST, "threads", credential)?
            .json(&body);
        Ok(send_json::<IdResponse>(builder).await?.id)
    }

    async fn create_run(
        &self,
        credential: &SecretString,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
    ) -> Result<String, Error> {
        let builder = self
            .thread_request(Method::POST, &format!("threads/{thread_id}/runs"), credential)?
            .json(&CreateRunRequest {
                assistant_id,
                instructions,
            });
        Ok(send_json::<IdResponse>(builder).await?.id)
    }

    async fn get_run_status(
        &self,
        credential: &SecretString,
        thread_id: &str,
        run_id: &str,
    ) -> Result<String, Error> {
        let builder = self.thread_request(
            Method::GET,
            &format!("threads/{thread_id}/runs/{run_id}"),
            credential,
        )?;
        Ok(send_json::<RunResponse>(builder).await?.status)
    }

    async fn list_messages(
        &self,
        credential: &SecretString,
        thread_id: &str,
    ) -> Result<Vec<ThreadMessage>, Error> {
        let builder = self
            .thread_request(
                Method::GET,
                &format!("threads/{thread_id}/messages"),
                credential,
            )?
            .query(&[("order", "desc")]);
        let response: MessageListResponse = send_json(builder).await?;
        Ok(response.data.into_iter().map(ThreadMessage::from).collect())
    }
}

#[async_trait]
impl ChatCompletionApi for OpenAIClient {
    async fn complete(
        &self,
        credential: &SecretString,
        request: &CompletionRequest,
    ) -> Result<String, Error> {
        let builder = self
            .request(Method::POST, "chat/completions", credential)?
            .json(request);
        let response: CompletionResponse = send_json(builder).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                Error::new(ErrorDetails::EmptyProviderAnswer {
                    model: request.model.clone(),
                })
            })
    }
}
