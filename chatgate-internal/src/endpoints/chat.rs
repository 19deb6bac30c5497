use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::context::TurnMessage;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::identity::AuthenticatedUser;
use crate::postprocess::{extract_priority, schedule_priority_update, ChatTurnResult};
use crate::providers::{resolve_credential, DispatchMode, TurnRequest};
use crate::store::AdminSettings;
use crate::telemetry::Severity;

pub const CHAT_ENDPOINT: &str = "/api/ai/chat";
pub const CHAT_ACTIVITY: &str = "ai_chat";

/// Returned with HTTP 200 whenever the provider could not produce an answer
pub const SOFT_FAIL_ANSWER: &str =
    "I'm sorry, I'm having trouble responding right now. Please try again in a moment.";

const NOT_CONFIGURED_ANSWER: &str =
    "The AI assistant is not configured yet. Please contact the site administrator.";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurnParams {
    pub message: String,
    #[serde(default)]
    pub conversation_history: Vec<TurnMessage>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub structured_data: Option<StructuredData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredData {
    #[serde(default)]
    pub site_images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurnResponse {
    pub response: String,
}

/// A handler for one AI chat turn.
///
/// Identity, rate limiting and quota run as middleware before this. Provider
/// failures never surface as HTTP errors: they are reported through telemetry
/// and answered with [`SOFT_FAIL_ANSWER`].
#[instrument(name = "chat_turn", skip_all)]
pub async fn chat_handler(
    State(app_state): AppState,
    Extension(user): Extension<AuthenticatedUser>,
    StructuredJson(params): StructuredJson<ChatTurnParams>,
) -> Result<Response, Error> {
    if params.message.trim().is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "`message` must not be empty".to_string(),
        }));
    }
    let started = Instant::now();

    let settings = match app_state.settings_cache.get().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Falling back to default admin settings: {e}");
            Arc::new(AdminSettings::default())
        }
    };

    let Some(credential) = resolve_credential(&settings, &app_state.config.chat.api_key_env)
    else {
        let error = Error::new(ErrorDetails::ProviderCredentialMissing);
        app_state.telemetry.log_activity(
            user.id(),
            CHAT_ACTIVITY,
            json!({ "outcome": "not_configured" }),
            false,
        );
        return Ok((
            error.status_code(),
            Json(json!({
                "error": error.to_string(),
                "response": NOT_CONFIGURED_ANSWER,
            })),
        )
            .into_response());
    };

    let mode = app_state.dispatcher.mode_for(&settings);
    let outcome = run_turn(&app_state, &user, &params, &settings, &credential, &mode).await;

    let (answer, details, success) = match outcome {
        Ok(result) => {
            schedule_priority_update(
                Arc::clone(&app_state.data_store),
                params.conversation_id.as_deref(),
                &result,
            );
            metrics::counter!("chatgate_chat_turns_total", "outcome" => "success").increment(1);
            let details = json!({
                "conversation_id": params.conversation_id,
                "mode": mode.as_str(),
                "outcome": "success",
                "priority_score": result.priority_score,
            });
            (result.visible_text, details, true)
        }
        Err(e) => {
            app_state.telemetry.log_error(
                &format!("AI chat turn failed: {e}"),
                Severity::Error,
                json!({
                    "endpoint": CHAT_ENDPOINT,
                    "user_id": user.id(),
                    "mode": mode.as_str(),
                    "message_length": params.message.chars().count(),
                    "error": e.to_string(),
                }),
            );
            metrics::counter!("chatgate_chat_turns_total", "outcome" => "soft_fail").increment(1);
            let details = json!({
                "conversation_id": params.conversation_id,
                "mode": mode.as_str(),
                "outcome": "soft_fail",
            });
            (SOFT_FAIL_ANSWER.to_string(), details, false)
        }
    };

    app_state
        .telemetry
        .log_activity(user.id(), CHAT_ACTIVITY, details, success);
    app_state
        .telemetry
        .check_duration(CHAT_ENDPOINT, started.elapsed());

    Ok((StatusCode::OK, Json(ChatTurnResponse { response: answer })).into_response())
}

/// Assembles context, dispatches to the provider and strips the priority tag
async fn run_turn(
    app_state: &AppStateData,
    user: &AuthenticatedUser,
    params: &ChatTurnParams,
    settings: &AdminSettings,
    credential: &SecretString,
    mode: &DispatchMode,
) -> Result<ChatTurnResult, Error> {
    let context = app_state
        .assembler
        .build_context(
            user.id(),
            &params.message,
            &params.conversation_history,
            settings,
        )
        .await?;
    let image_urls = params
        .structured_data
        .as_ref()
        .map(|data| data.site_images.as_slice())
        .unwrap_or_default();

    let turn = TurnRequest {
        context: &context,
        history: &params.conversation_history,
        image_urls,
        settings,
        credential,
    };
    let raw_answer = app_state.dispatcher.execute(&turn).await?;
    let result = extract_priority(&raw_answer);
    if result.visible_text.trim().is_empty() {
        let model = match mode {
            DispatchMode::ThreadRun { assistant_id } => assistant_id,
            DispatchMode::Completion { model } => model,
        };
        return Err(Error::new(ErrorDetails::EmptyProviderAnswer {
            model: model.clone(),
        }));
    }
    Ok(result)
}
