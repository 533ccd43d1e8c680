//! Typed errors for the LLM dispatcher.

use thiserror::Error;

/// Classification matters for retry policy (`spec.md` §4.4): transient
/// kinds are retried in place by [`crate::dispatcher::Dispatcher::call_single`];
/// `Validation` never is — it is surfaced as a partial-success result
/// instead.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("request timed out")]
    Timeout,

    #[error("server error (status {0})")]
    ServerError(u16),

    #[error("rate limited")]
    RateLimited,

    #[error("empty response from provider")]
    EmptyResponse,

    #[error("response was not valid JSON even after repair: {0}")]
    Unparseable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl LlmError {
    /// Whether the dispatcher should retry in place, per the retry
    /// policy in `spec.md` §4.4: network/timeout/5xx/rate-limit/empty
    /// are retried; validation errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Network(_) | LlmError::Timeout | LlmError::ServerError(_) | LlmError::RateLimited | LlmError::EmptyResponse
        )
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
