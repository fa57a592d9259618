use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::Stage;
use crate::error::{ErrorCode, StepError};

/// Source material supplied by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub title: String,
    pub source_link: String,
    pub category: String,
    pub raw_content: String,
}

/// Failure diagnostics, cleared by the next successful transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub last_error: Option<String>,
    pub error_stage: Option<Stage>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl Diagnostics {
    pub fn from_error(stage: Stage, code: ErrorCode, message: &str) -> Self {
        Self {
            last_error: Some(format!("{code}: {message}")),
            error_stage: Some(stage),
            error_code: Some(code),
            error_message: Some(message.to_string()),
        }
    }

    pub fn is_clear(&self) -> bool {
        self.last_error.is_none()
            && self.error_stage.is_none()
            && self.error_code.is_none()
            && self.error_message.is_none()
    }
}

/// Result of checking the final article. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub passed: bool,
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

/// Stage 1 result: a first draft composed from the news item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedDraft {
    pub title: String,
    pub body: String,
}

/// Stage 2 result: the editorially revised draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisedDraft {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

/// Stage 3 result: the publishable article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalArticle {
    pub title: String,
    pub slug: String,
    pub meta_description: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The one step a draft is waiting on, carrying exactly that step's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStep {
    Compose { source: SourceItem },
    Revise { draft: String },
    Finalize { revision: String },
}

/// One article in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub source: SourceItem,
    pub stage: Stage,
    pub stage1_output: Option<String>,
    pub stage2_output: Option<String>,
    pub final_output: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub diagnostics: Diagnostics,
    pub validation: Option<Validation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.trim().is_empty())
}

impl Draft {
    /// True while any worker holds the row, stale or not.
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Resolve the step to run for the current stage.
    ///
    /// Missing input can never be retried into existence, so it is reported
    /// as a permanent error, as is any stage with nothing left to run.
    pub fn pending_step(&self) -> Result<PendingStep, StepError> {
        match self.stage {
            Stage::New | Stage::Queued => {
                if self.source.raw_content.trim().is_empty() && self.source.title.trim().is_empty()
                {
                    return Err(StepError::MissingInput {
                        stage: self.stage,
                        field: "source content",
                    });
                }
                Ok(PendingStep::Compose {
                    source: self.source.clone(),
                })
            }
            Stage::Stage1Done => match non_empty(&self.stage1_output) {
                Some(draft) => Ok(PendingStep::Revise {
                    draft: draft.to_string(),
                }),
                None => Err(StepError::MissingInput {
                    stage: self.stage,
                    field: "stage-1 output",
                }),
            },
            Stage::Stage2Done => match non_empty(&self.stage2_output) {
                Some(revision) => Ok(PendingStep::Finalize {
                    revision: revision.to_string(),
                }),
                None => Err(StepError::MissingInput {
                    stage: self.stage,
                    field: "stage-2 output",
                }),
            },
            Stage::Saved | Stage::Failed => Err(StepError::NoHandler(self.stage)),
        }
    }

    /// Operator-facing summary of how far the draft got.
    pub fn progress_label(&self, max_attempts: u32) -> String {
        match self.stage {
            Stage::Saved => "saved".to_string(),
            Stage::Failed => {
                let failed_step = self
                    .diagnostics
                    .error_stage
                    .and_then(Stage::step_number)
                    .unwrap_or(1);
                let reason = if self.attempts >= max_attempts {
                    " (retries exhausted)"
                } else {
                    ""
                };
                if failed_step > 1 {
                    format!(
                        "stage {} complete, stage {failed_step} failed{reason}",
                        failed_step - 1
                    )
                } else {
                    format!("stage 1 failed{reason}")
                }
            }
            stage => {
                let completed = stage.step_number().unwrap_or(1) - 1;
                let base = if completed == 0 {
                    "not started".to_string()
                } else {
                    format!("stage {completed} complete")
                };
                if self.next_retry_at.is_some() {
                    format!(
                        "{base}, retry {}/{} pending",
                        self.attempts + 1,
                        max_attempts
                    )
                } else if self.is_locked() {
                    format!("{base}, stage {} running", completed + 1)
                } else {
                    base
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_source() -> SourceItem {
        SourceItem {
            title: "Central bank holds rates".into(),
            source_link: "https://news.example.com/rates".into(),
            category: "economy".into(),
            raw_content: "The central bank left its policy rate unchanged.".into(),
        }
    }

    pub(crate) fn sample_draft(stage: Stage) -> Draft {
        let now = Utc::now();
        Draft {
            id: "d-1".into(),
            source: sample_source(),
            stage,
            stage1_output: None,
            stage2_output: None,
            final_output: None,
            locked_at: None,
            locked_by: None,
            attempts: 0,
            next_retry_at: None,
            diagnostics: Diagnostics::default(),
            validation: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn new_and_queued_compose_from_source() {
        for stage in [Stage::New, Stage::Queued] {
            let step = sample_draft(stage).pending_step().unwrap();
            assert_eq!(
                step,
                PendingStep::Compose {
                    source: sample_source()
                }
            );
        }
    }

    #[test]
    fn empty_source_is_missing_input() {
        let mut draft = sample_draft(Stage::Queued);
        draft.source.title = " ".into();
        draft.source.raw_content = String::new();
        let err = draft.pending_step().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingInput);
        assert!(err.to_string().contains("source content"));

        draft.source.title = "Headline only".into();
        assert!(draft.pending_step().is_ok());
    }

    #[test]
    fn stage1_done_without_output_is_missing_input() {
        let mut draft = sample_draft(Stage::Stage1Done);
        draft.stage1_output = Some("   ".into());
        let err = draft.pending_step().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingInput);
        assert!(err.to_string().contains("stage-1 output"));
    }

    #[test]
    fn stage2_done_uses_existing_revision() {
        let mut draft = sample_draft(Stage::Stage2Done);
        draft.stage1_output = Some("first".into());
        draft.stage2_output = Some("second".into());
        assert_eq!(
            draft.pending_step().unwrap(),
            PendingStep::Finalize {
                revision: "second".into()
            }
        );
    }

    #[test]
    fn terminal_stages_have_no_handler() {
        for stage in [Stage::Saved, Stage::Failed] {
            let err = sample_draft(stage).pending_step().unwrap_err();
            assert_eq!(err.code(), ErrorCode::NoHandler);
        }
    }

    #[test]
    fn progress_label_reports_failed_step() {
        let mut draft = sample_draft(Stage::Failed);
        draft.diagnostics =
            Diagnostics::from_error(Stage::Stage2Done, ErrorCode::RateLimited, "slow down");
        draft.attempts = 3;
        assert_eq!(
            draft.progress_label(3),
            "stage 2 complete, stage 3 failed (retries exhausted)"
        );

        draft.diagnostics =
            Diagnostics::from_error(Stage::New, ErrorCode::MissingInput, "no source");
        draft.attempts = 0;
        assert_eq!(draft.progress_label(3), "stage 1 failed");
    }

    #[test]
    fn progress_label_reports_pending_retry() {
        let mut draft = sample_draft(Stage::Stage1Done);
        draft.attempts = 1;
        draft.next_retry_at = Some(Utc::now());
        assert_eq!(draft.progress_label(3), "stage 1 complete, retry 2/3 pending");
        assert_eq!(sample_draft(Stage::New).progress_label(3), "not started");
        assert_eq!(sample_draft(Stage::Saved).progress_label(3), "saved");
    }

    #[test]
    fn diagnostics_from_error_formats_last_error() {
        let diag = Diagnostics::from_error(Stage::Queued, ErrorCode::ApiError, "boom");
        assert_eq!(diag.last_error.as_deref(), Some("API_ERROR: boom"));
        assert!(!diag.is_clear());
        assert!(Diagnostics::default().is_clear());
    }
}
