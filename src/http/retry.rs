//! Fixed-delay retry with per-attempt failure classification.

use log::{debug, warn};
use reqwest::StatusCode;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use super::error::LlmError;
use crate::config::ServiceConfig;

/// Category of a single failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 404
    NotFound,
    /// Any other non-success status below 500
    Rejected(u16),
    /// HTTP 5xx
    ServerError(u16),
    /// Connection could not be established
    Connect,
    /// No response within the attempt's timeout
    Timeout,
    /// Body read errors, invalid JSON, request building, ...
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::NotFound => write!(f, "not-found"),
            FailureKind::Rejected(status) => write!(f, "upstream-rejected({})", status),
            FailureKind::ServerError(status) => write!(f, "server-error({})", status),
            FailureKind::Connect => write!(f, "connect-failed"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Other => write!(f, "other"),
        }
    }
}

/// A failed attempt: its category plus a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Classifies a transport-level reqwest error.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        Self::new(classify_error(error), error.to_string())
    }

    /// The terminal error reported once this failure ends the call.
    pub fn into_error(self) -> LlmError {
        match self.kind {
            FailureKind::NotFound => LlmError::NotFound,
            FailureKind::Rejected(status) => LlmError::Rejected {
                status,
                detail: self.detail,
            },
            FailureKind::ServerError(_) => LlmError::Internal,
            FailureKind::Connect => LlmError::Unavailable,
            FailureKind::Timeout => LlmError::Timeout,
            FailureKind::Other => LlmError::CallFailed(self.detail),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Maps a non-success HTTP status to its failure category.
pub fn classify_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::NOT_FOUND => FailureKind::NotFound,
        s if s.is_server_error() => FailureKind::ServerError(s.as_u16()),
        s => FailureKind::Rejected(s.as_u16()),
    }
}

/// Maps a reqwest error to its failure category.
/// Timeouts win over connect errors, so a connect timeout counts as a timeout.
pub fn classify_error(error: &reqwest::Error) -> FailureKind {
    if error.is_timeout() {
        return FailureKind::Timeout;
    }
    if error.is_connect() {
        return FailureKind::Connect;
    }
    match error.status() {
        Some(status) if !status.is_success() => classify_status(status),
        _ => FailureKind::Other,
    }
}

/// How many times a buffered call is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }

    /// Whether another attempt may succeed after a failure of this kind.
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::NotFound | FailureKind::Rejected(_) => false,
            FailureKind::ServerError(_)
            | FailureKind::Connect
            | FailureKind::Timeout
            | FailureKind::Other => true,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. The closure receives the 1-based attempt number.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T, LlmError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let mut attempt = 1;

        loop {
            let failure = match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(failure) => failure,
            };

            if !self.is_retryable(failure.kind) {
                debug!("{}: non-retryable failure ({})", operation_name, failure);
                return Err(failure.into_error());
            }

            if attempt >= self.max_retries {
                warn!(
                    "{}: attempt {}/{} failed ({}), giving up",
                    operation_name, attempt, self.max_retries, failure
                );
                return Err(failure.into_error());
            }

            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {:?}...",
                operation_name, attempt, self.max_retries, failure, self.retry_delay
            );
            tokio::time::sleep(self.retry_delay).await;
            attempt += 1;
        }
    }
}
