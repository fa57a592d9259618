//! Failure classification and retry scheduling.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, StepError};

/// Whether a step failure is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// Retrying cannot fix it (missing input, nothing to run).
    Permanent { code: ErrorCode, message: String },
    /// Likely to succeed later (service errors, parse glitches, crashes).
    Transient { code: ErrorCode, message: String },
}

impl Classification {
    pub fn code(&self) -> ErrorCode {
        match self {
            Classification::Permanent { code, .. } | Classification::Transient { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Classification::Permanent { message, .. }
            | Classification::Transient { message, .. } => message,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Classification::Permanent { .. })
    }
}

pub fn classify(error: &StepError) -> Classification {
    let code = error.code();
    let message = error.to_string();
    match error {
        StepError::MissingInput { .. } | StepError::NoHandler(_) => {
            Classification::Permanent { code, message }
        }
        StepError::Authoring(_) | StepError::Unexpected(_) => {
            Classification::Transient { code, message }
        }
    }
}

/// What to do with a draft after a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Stay at the current stage and try again no earlier than `at`.
    Retry { attempts: u32, at: DateTime<Utc> },
    /// Transient failures used up every attempt.
    Exhausted { attempts: u32 },
    /// Fail now; attempts are left as they were.
    Permanent { attempts: u32 },
}

/// Upper bound on a single backoff wait (one week).
pub const MAX_BACKOFF_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Transient failures allowed before a draft is failed for good.
    pub max_attempts: u32,
    /// Linear backoff unit: the n-th retry waits `n * backoff_step_minutes`.
    pub backoff_step_minutes: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_minutes: 2,
        }
    }
}

impl RetryPolicy {
    /// Wait before the `attempts`-th retry, clamped to [`MAX_BACKOFF_MINUTES`].
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let minutes = self
            .backoff_step_minutes
            .saturating_mul(i64::from(attempts))
            .clamp(0, MAX_BACKOFF_MINUTES);
        Duration::minutes(minutes)
    }

    /// `attempts` is the count recorded on the draft before this failure.
    pub fn decide(
        &self,
        attempts: u32,
        classification: &Classification,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if classification.is_permanent() {
            return RetryDecision::Permanent { attempts };
        }
        let attempts = attempts + 1;
        if attempts >= self.max_attempts {
            RetryDecision::Exhausted { attempts }
        } else {
            RetryDecision::Retry {
                attempts,
                at: now + self.backoff_for(attempts),
            }
        }
    }
}
