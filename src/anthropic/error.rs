//! Error types for the Anthropic Messages client.
//!
//! Every variant is a failure of the authoring service, and all of them are
//! retryable from the pipeline's point of view. [`AnthropicError::code`]
//! maps each one to the diagnostic code persisted on the draft.

use thiserror::Error;

use crate::error::ErrorCode;

/// Errors that can occur while talking to the Anthropic API.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The account is out of credit or over its usage quota.
    #[error("quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// Any other non-success HTTP status.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    /// The response could not be read into the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Underlying transport failure (DNS, connection refused, TLS).
    #[error("network error: {0}")]
    NetworkError(#[source] reqwest::Error),
}

impl From<reqwest::Error> for AnthropicError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnthropicError::Timeout
        } else if err.is_decode() {
            AnthropicError::MalformedResponse(err.to_string())
        } else {
            AnthropicError::NetworkError(err)
        }
    }
}

impl AnthropicError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AnthropicError::RateLimited { .. } => ErrorCode::RateLimited,
            AnthropicError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            AnthropicError::ApiError { .. } | AnthropicError::NetworkError(_) => {
                ErrorCode::ApiError
            }
            AnthropicError::Timeout => ErrorCode::Timeout,
            AnthropicError::MalformedResponse(_) => ErrorCode::MalformedResponse,
        }
    }
}
