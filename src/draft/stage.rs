use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The stages a draft moves through.
///
/// Each draft flows: NEW → QUEUED → STAGE1_DONE → STAGE2_DONE → SAVED,
/// or ends in FAILED from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    New,
    Queued,
    #[serde(rename = "STAGE1_DONE")]
    Stage1Done,
    #[serde(rename = "STAGE2_DONE")]
    Stage2Done,
    Saved,
    Failed,
}

/// Stages a worker may pick up.
pub const PROCESSABLE: [Stage; 4] = [
    Stage::New,
    Stage::Queued,
    Stage::Stage1Done,
    Stage::Stage2Done,
];

impl Stage {
    /// Persisted and wire name, e.g. `STAGE1_DONE`.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::New => "NEW",
            Stage::Queued => "QUEUED",
            Stage::Stage1Done => "STAGE1_DONE",
            Stage::Stage2Done => "STAGE2_DONE",
            Stage::Saved => "SAVED",
            Stage::Failed => "FAILED",
        }
    }

    /// Is there an authoring step left to run from this stage?
    pub fn is_processable(self) -> bool {
        PROCESSABLE.contains(&self)
    }

    /// Position along the forward sequence. `Failed` sits outside it.
    pub fn ordinal(self) -> Option<u8> {
        match self {
            Stage::New => Some(0),
            Stage::Queued => Some(1),
            Stage::Stage1Done => Some(2),
            Stage::Stage2Done => Some(3),
            Stage::Saved => Some(4),
            Stage::Failed => None,
        }
    }

    /// The authoring step (1..=3) this stage is waiting on.
    pub fn step_number(self) -> Option<u8> {
        match self {
            Stage::New | Stage::Queued => Some(1),
            Stage::Stage1Done => Some(2),
            Stage::Stage2Done => Some(3),
            Stage::Saved | Stage::Failed => None,
        }
    }

    /// Stage reached when the pending step succeeds.
    pub fn advanced(self) -> Option<Stage> {
        match self {
            Stage::New | Stage::Queued => Some(Stage::Stage1Done),
            Stage::Stage1Done => Some(Stage::Stage2Done),
            Stage::Stage2Done => Some(Stage::Saved),
            Stage::Saved | Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Stage::New),
            "QUEUED" => Ok(Stage::Queued),
            "STAGE1_DONE" => Ok(Stage::Stage1Done),
            "STAGE2_DONE" => Ok(Stage::Stage2Done),
            "SAVED" => Ok(Stage::Saved),
            "FAILED" => Ok(Stage::Failed),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}
