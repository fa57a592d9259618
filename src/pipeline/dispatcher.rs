use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::handlers::StageHandlers;
use super::lock::LockManager;
use super::retry::{Classification, RetryDecision, RetryPolicy, classify};
use super::validation::validate;
use crate::anthropic::MessageSender;
use crate::draft::{Diagnostics, Draft, PendingStep, Stage};
use crate::error::{ErrorCode, PipelineError, StepError};
use crate::store::{DraftStore, StageWrite};

/// What one `process_one_step` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// No draft could be claimed.
    Idle,
    Advanced {
        draft_id: String,
        from: Stage,
        to: Stage,
    },
    /// Transient failure; the draft stays at `stage` until `retry_at`.
    RetryScheduled {
        draft_id: String,
        stage: Stage,
        attempts: u32,
        retry_at: DateTime<Utc>,
        failure: Classification,
    },
    Failed {
        draft_id: String,
        from: Stage,
        attempts: u32,
        failure: Classification,
        exhausted: bool,
    },
}

impl StepOutcome {
    pub fn draft_id(&self) -> Option<&str> {
        match self {
            StepOutcome::Idle => None,
            StepOutcome::Advanced { draft_id, .. }
            | StepOutcome::RetryScheduled { draft_id, .. }
            | StepOutcome::Failed { draft_id, .. } => Some(draft_id),
        }
    }

    pub fn prev_stage(&self) -> Option<Stage> {
        match self {
            StepOutcome::Idle => None,
            StepOutcome::Advanced { from, .. } | StepOutcome::Failed { from, .. } => Some(*from),
            StepOutcome::RetryScheduled { stage, .. } => Some(*stage),
        }
    }

    pub fn new_stage(&self) -> Option<Stage> {
        match self {
            StepOutcome::Idle => None,
            StepOutcome::Advanced { to, .. } => Some(*to),
            StepOutcome::RetryScheduled { stage, .. } => Some(*stage),
            StepOutcome::Failed { .. } => Some(Stage::Failed),
        }
    }
}

/// Error half of a [`StepReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedError {
    pub code: ErrorCode,
    pub message: String,
    pub permanent: bool,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Wire form of a step result, returned to cron and the admin UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub ok: bool,
    pub draft_id: Option<String>,
    pub prev_stage: Option<Stage>,
    pub new_stage: Option<Stage>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StepReport {
    pub fn from_outcome(outcome: &StepOutcome, elapsed: Duration) -> Self {
        let error = match outcome {
            StepOutcome::RetryScheduled {
                attempts,
                retry_at,
                failure,
                ..
            } => Some(ReportedError {
                code: failure.code(),
                message: failure.message().to_string(),
                permanent: false,
                attempts: *attempts,
                next_retry_at: Some(*retry_at),
            }),
            StepOutcome::Failed {
                attempts, failure, ..
            } => Some(ReportedError {
                code: failure.code(),
                message: failure.message().to_string(),
                permanent: failure.is_permanent(),
                attempts: *attempts,
                next_retry_at: None,
            }),
            StepOutcome::Idle | StepOutcome::Advanced { .. } => None,
        };
        let message = match outcome {
            StepOutcome::Idle => Some("nothing to process".to_string()),
            _ => None,
        };
        Self {
            ok: matches!(outcome, StepOutcome::Advanced { .. }),
            draft_id: outcome.draft_id().map(str::to_string),
            prev_stage: outcome.prev_stage(),
            new_stage: outcome.new_stage(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            error,
            message,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, StepError> {
    serde_json::to_string(value).map_err(|e| StepError::Unexpected(e.to_string()))
}

/// Runs at most one stage transition per call.
pub struct StepDispatcher<S> {
    store: DraftStore,
    locks: LockManager,
    handlers: StageHandlers<S>,
    policy: RetryPolicy,
}

impl<S: MessageSender> StepDispatcher<S> {
    pub fn new(
        store: DraftStore,
        locks: LockManager,
        handlers: StageHandlers<S>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            locks,
            handlers,
            policy,
        }
    }

    /// Retry budget and backoff applied to failed steps.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Lock manager, exposed for the worker id shown by `run`.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Claim a draft (the given one, or the oldest eligible), run the one
    /// step its stage calls for, persist the result and release the claim.
    ///
    /// Step failures are recorded on the draft and returned as outcomes.
    /// Only storage problems come back as `Err`; a claim left behind that
    /// way is picked up again once it goes stale.
    pub async fn process_one_step(
        &self,
        draft_id: Option<&str>,
    ) -> Result<StepOutcome, PipelineError> {
        let Some(draft) = self.locks.acquire(draft_id)? else {
            debug!(requested = ?draft_id, "nothing to process");
            return Ok(StepOutcome::Idle);
        };

        let from = draft.stage;
        match self.run_step(&draft).await {
            Ok(write) => {
                let to = write.target();
                debug_assert!(to.ordinal() > from.ordinal());
                let applied = self.store.record_success(
                    &draft.id,
                    self.locks.worker().as_str(),
                    &write,
                    self.locks.now(),
                )?;
                if !applied {
                    return Err(PipelineError::LockLost {
                        draft_id: draft.id,
                        worker: self.locks.worker().to_string(),
                    });
                }
                self.locks.release_success(&draft.id)?;
                info!(draft_id = %draft.id, %from, %to, "step completed");
                Ok(StepOutcome::Advanced {
                    draft_id: draft.id,
                    from,
                    to,
                })
            }
            Err(err) => self.fail(draft, err),
        }
    }

    /// Like [`Self::process_one_step`], timed and in wire form.
    pub async fn process_step_report(
        &self,
        draft_id: Option<&str>,
    ) -> Result<StepReport, PipelineError> {
        let started = Instant::now();
        let outcome = self.process_one_step(draft_id).await?;
        Ok(StepReport::from_outcome(&outcome, started.elapsed()))
    }

    /// Cron-style run: keep stepping until nothing is eligible or
    /// `max_steps` steps have run.
    pub async fn drain(
        &self,
        max_steps: usize,
        mut on_step: impl FnMut(&StepOutcome),
    ) -> Result<Vec<StepOutcome>, PipelineError> {
        let mut outcomes = Vec::new();
        while outcomes.len() < max_steps {
            let outcome = self.process_one_step(None).await?;
            if outcome == StepOutcome::Idle {
                break;
            }
            on_step(&outcome);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run_step(&self, draft: &Draft) -> Result<StageWrite, StepError> {
        let step = draft.pending_step()?;
        AssertUnwindSafe(self.execute(step))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(StepError::Unexpected(panic_message(payload))))
    }

    async fn execute(&self, step: PendingStep) -> Result<StageWrite, StepError> {
        match step {
            PendingStep::Compose { source } => {
                let drafted = self.handlers.compose(&source).await?;
                Ok(StageWrite::Composed {
                    output: encode(&drafted)?,
                })
            }
            PendingStep::Revise { draft } => {
                let revised = self.handlers.revise(&draft).await?;
                Ok(StageWrite::Revised {
                    output: encode(&revised)?,
                })
            }
            PendingStep::Finalize { revision } => {
                let article = self.handlers.finalize(&revision).await?;
                let validation = validate(&article);
                Ok(StageWrite::Finalized {
                    output: encode(&article)?,
                    validation,
                })
            }
        }
    }

    fn fail(&self, draft: Draft, err: StepError) -> Result<StepOutcome, PipelineError> {
        let failure = classify(&err);
        let diagnostics = Diagnostics::from_error(draft.stage, failure.code(), failure.message());
        let decision = self
            .policy
            .decide(draft.attempts, &failure, self.locks.now());

        match decision {
            RetryDecision::Retry { attempts, at } => {
                self.locks
                    .release_for_retry(&draft.id, attempts, at, &diagnostics)?;
                warn!(
                    draft_id = %draft.id,
                    stage = %draft.stage,
                    code = %failure.code(),
                    attempts,
                    retry_at = %at,
                    "step failed, retry scheduled"
                );
                Ok(StepOutcome::RetryScheduled {
                    draft_id: draft.id,
                    stage: draft.stage,
                    attempts,
                    retry_at: at,
                    failure,
                })
            }
            RetryDecision::Exhausted { attempts } | RetryDecision::Permanent { attempts } => {
                let exhausted = matches!(decision, RetryDecision::Exhausted { .. });
                self.locks
                    .release_failed(&draft.id, attempts, &diagnostics)?;
                error!(
                    draft_id = %draft.id,
                    stage = %draft.stage,
                    code = %failure.code(),
                    attempts,
                    exhausted,
                    "step failed, draft marked FAILED"
                );
                Ok(StepOutcome::Failed {
                    draft_id: draft.id,
                    from: draft.stage,
                    attempts,
                    failure,
                    exhausted,
                })
            }
        }
    }
}
