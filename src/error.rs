//! Error types for ccrelay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for ccrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ccrelay.
///
/// Upstream non-2xx responses are not errors: they are relayed verbatim and
/// only feed the health state machine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("Model '{model}' is not allowed for this API key")]
    ModelNotAllowed { model: String },

    #[error("Too many requests from this client")]
    TooManyRequests,

    #[error("No available account in group {group_id}")]
    NoAccountAvailable { group_id: i64 },

    #[error("Upstream request timed out")]
    Timeout,

    #[error("Upstream request failed: {0}")]
    Network(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::ModelNotAllowed { .. } => StatusCode::FORBIDDEN,
            Error::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Error::NoAccountAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout => StatusCode::REQUEST_TIMEOUT,
            Error::Network(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Directory(_) | Error::Database(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The `error.type` string of the envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "invalid_request_error",
            Error::Unauthorized => "authentication_error",
            Error::ModelNotAllowed { .. } => "permission_error",
            Error::TooManyRequests => "rate_limit_error",
            Error::NoAccountAvailable { .. } => "no_available_account",
            Error::Timeout => "timeout_error",
            Error::Network(_) => "network_error",
            Error::Config(_) | Error::Directory(_) | Error::Database(_) | Error::Internal(_) => {
                "api_error"
            }
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(err.to_string())
        }
    }
}

/// Build the messages-protocol error envelope.
pub fn error_envelope(error_type: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message
        }
    })
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = error_envelope(self.error_type(), &self.to_string());
        (status, axum::Json(body)).into_response()
    }
}
