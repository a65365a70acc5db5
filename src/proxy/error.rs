use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::warn;
use serde_json::{Value, json};

use crate::http::LlmError;

/// Errors returned by proxy handlers, rendered as `{"detail": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing api-key header")]
    MissingApiKey,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("no {0} tab is open for this API key")]
    TabNotFound(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// The LLM service answered but reported failure or an unexpected shape.
    #[error("{0}")]
    Failed(String),
}

impl ApiError {
    /// Builds a [`ApiError::Failed`] from an upstream reply's `error` field.
    pub fn upstream(data: &Value, fallback: &str) -> Self {
        let message = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or(fallback);
        ApiError::Failed(message.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingApiKey => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ApiError::TabNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Llm(e) => e.status_code(),
            ApiError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self);
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
