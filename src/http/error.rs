//! Terminal error taxonomy for calls to the LLM service.

use reqwest::StatusCode;

/// Errors surfaced by the outbound call adapter once retries are settled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// The upstream endpoint does not exist (HTTP 404).
    #[error("LLM service endpoint not found")]
    NotFound,
    /// The upstream rejected the request with a non-404 client error.
    #[error("LLM service rejected the request (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },
    /// The upstream kept answering with 5xx until the attempts ran out.
    #[error("LLM service internal error")]
    Internal,
    /// No connection could be established.
    #[error("cannot connect to the LLM service")]
    Unavailable,
    /// The upstream did not answer in time.
    #[error("LLM service timed out")]
    Timeout,
    /// Anything else, with the underlying cause.
    #[error("LLM service call failed: {0}")]
    CallFailed(String),
    /// The health endpoint answered but did not report success.
    #[error("LLM service reported itself unhealthy")]
    Unhealthy,
    /// A call was issued after the shared client was closed.
    #[error("LLM service client has been closed")]
    ClientClosed,
}

impl LlmError {
    /// HTTP status a proxy should answer with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            LlmError::NotFound => StatusCode::NOT_FOUND,
            LlmError::Rejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            LlmError::Unavailable | LlmError::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            LlmError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            LlmError::Internal | LlmError::CallFailed(_) | LlmError::ClientClosed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
