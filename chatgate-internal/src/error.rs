use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use std::fmt::{Debug, Display};
use tokio::sync::OnceCell;

/// Controls whether raw provider responses are included in error output.
///
/// WARNING: enabling this exposes provider payloads (which may echo user
/// messages or documents) in logs and error bodies.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

fn debug_enabled() -> bool {
    *DEBUG.get().unwrap_or(&false)
}

/// Chooses between a `Debug` or `Display` representation based on the gateway-level `DEBUG` flag.
pub struct DisplayOrDebugGateway<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebugGateway<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebugGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if debug_enabled() {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

#[derive(Debug, PartialEq)]
// The inner box is private so every error goes through `new` and gets logged.
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    DataStore {
        operation: String,
        message: String,
    },
    EmptyProviderAnswer {
        model: String,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    MissingIdentity,
    NoAssistantAnswer {
        thread_id: String,
    },
    Observability {
        message: String,
    },
    ProviderCredentialMissing,
    ProviderRequest {
        message: String,
        status_code: Option<StatusCode>,
        raw_response: Option<String>,
    },
    ProviderRunFailed {
        run_id: String,
        status: String,
    },
    ProviderRunTimeout {
        run_id: String,
        attempts: u32,
    },
    RateLimitStore {
        message: String,
    },
    RouteNotFound {
        path: String,
    },
    Serialization {
        message: String,
    },
    UsageStore {
        message: String,
    },
    Webhook {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::DataStore { .. } => tracing::Level::ERROR,
            ErrorDetails::EmptyProviderAnswer { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::MissingIdentity => tracing::Level::WARN,
            ErrorDetails::NoAssistantAnswer { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::ProviderCredentialMissing => tracing::Level::ERROR,
            ErrorDetails::ProviderRequest { .. } => tracing::Level::ERROR,
            ErrorDetails::ProviderRunFailed { .. } => tracing::Level::ERROR,
            ErrorDetails::ProviderRunTimeout { .. } => tracing::Level::ERROR,
            ErrorDetails::RateLimitStore { .. } => tracing::Level::ERROR,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::UsageStore { .. } => tracing::Level::ERROR,
            ErrorDetails::Webhook { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::DataStore { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::EmptyProviderAnswer { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::MissingIdentity => StatusCode::UNAUTHORIZED,
            ErrorDetails::NoAssistantAnswer { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ProviderCredentialMissing => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::ProviderRequest { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::ProviderRunFailed { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::ProviderRunTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ErrorDetails::RateLimitStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UsageStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Webhook { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::DataStore { operation, message } => {
                write!(f, "Data store `{operation}` failed: {message}")
            }
            ErrorDetails::EmptyProviderAnswer { model } => {
                write!(f, "Provider returned an empty answer for model `{model}`")
            }
            ErrorDetails::InternalError { message } => write!(f, "{message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::MissingIdentity => write!(f, "Authentication required"),
            ErrorDetails::NoAssistantAnswer { thread_id } => write!(
                f,
                "Run completed but thread `{thread_id}` has no assistant message"
            ),
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::ProviderCredentialMissing => {
                write!(f, "AI service is not configured: no provider API key available")
            }
            ErrorDetails::ProviderRequest {
                message,
                status_code,
                raw_response,
            } => {
                match status_code {
                    Some(status) => write!(f, "Provider request failed ({status}): {message}")?,
                    None => write!(f, "Provider request failed: {message}")?,
                }
                if let (true, Some(raw)) = (debug_enabled(), raw_response) {
                    write!(f, "\nRaw response: {raw}")?;
                }
                Ok(())
            }
            ErrorDetails::ProviderRunFailed { run_id, status } => {
                write!(f, "Provider run `{run_id}` ended with status `{status}`")
            }
            ErrorDetails::ProviderRunTimeout { run_id, attempts } => write!(
                f,
                "Provider run `{run_id}` did not finish after {attempts} status checks"
            ),
            ErrorDetails::RateLimitStore { message } => {
                write!(f, "Rate limit store error: {message}")
            }
            ErrorDetails::RouteNotFound { path } => write!(f, "Route not found: {path}"),
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::UsageStore { message } => {
                write!(f, "Usage store unavailable: {message}")
            }
            ErrorDetails::Webhook { message } => {
                write!(f, "Failed to deliver alert webhook: {message}")
            }
        }
    }
}

impl Error {
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        (self.status_code(), json!({"error": self.to_string()}))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
