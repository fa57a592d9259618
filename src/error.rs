use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::draft::Stage;

/// Infrastructure errors: anything that prevents a step outcome from being
/// persisted. Step failures themselves are never raised as this type.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Draft not found: {0}")]
    DraftNotFound(String),

    #[error("Lock on draft {draft_id} is no longer held by worker {worker}")]
    LockLost { draft_id: String, worker: String },

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Diagnostic code persisted in `error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingInput,
    NoHandler,
    QuotaExceeded,
    RateLimited,
    MalformedResponse,
    Timeout,
    ApiError,
    UnexpectedError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingInput => "MISSING_INPUT",
            ErrorCode::NoHandler => "NO_HANDLER",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::UnexpectedError => "UNEXPECTED_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            ErrorCode::MissingInput,
            ErrorCode::NoHandler,
            ErrorCode::QuotaExceeded,
            ErrorCode::RateLimited,
            ErrorCode::MalformedResponse,
            ErrorCode::Timeout,
            ErrorCode::ApiError,
            ErrorCode::UnexpectedError,
        ]
        .into_iter()
        .find(|code| code.as_str() == s)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single step did not advance its draft.
#[derive(Debug, Error)]
pub enum StepError {
    /// The stage's required input field is empty.
    #[error("missing {field} for stage {stage}")]
    MissingInput { stage: Stage, field: &'static str },

    #[error("no handler for stage {0}")]
    NoHandler(Stage),

    /// The authoring service failed or returned something unusable.
    #[error(transparent)]
    Authoring(#[from] AnthropicError),

    /// The handler blew up in a way it did not report itself.
    #[error("unexpected handler failure: {0}")]
    Unexpected(String),
}

impl StepError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StepError::MissingInput { .. } => ErrorCode::MissingInput,
            StepError::NoHandler(_) => ErrorCode::NoHandler,
            StepError::Authoring(err) => err.code(),
            StepError::Unexpected(_) => ErrorCode::UnexpectedError,
        }
    }
}
