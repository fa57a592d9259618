//! Single-owner claims on draft rows.
//!
//! Acquisition is two visibly separate operations: [`LockManager::candidate`]
//! picks a row with a plain select and guarantees nothing, and
//! [`LockManager::claim`] runs the conditional update that actually excludes
//! other workers. Locks older than the configured timeout are treated as
//! abandoned by both.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::draft::{Diagnostics, Draft};
use crate::error::PipelineError;
use crate::store::DraftStore;

/// Identity of one worker process, stamped into `locked_by`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `worker-<pid>-<8 random hex chars>`.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{}-{}", std::process::id(), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A draft picked for claiming. Holding one grants nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub draft_id: String,
    /// Requested by id: a manual resume that skips the backoff wait.
    pub explicit: bool,
}

pub struct LockManager {
    store: DraftStore,
    worker: WorkerId,
    lock_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(
        store: DraftStore,
        worker: WorkerId,
        lock_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            worker,
            lock_timeout,
            clock,
        }
    }

    /// Identity written to `locked_by` on claim.
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Current time from the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.lock_timeout
    }

    /// Advisory selection. With an id, that draft is the candidate as long as
    /// it exists and has a step left; otherwise the oldest processable, free
    /// and due draft.
    pub fn candidate(&self, draft_id: Option<&str>) -> Result<Option<Candidate>, PipelineError> {
        match draft_id {
            Some(id) => {
                let Some(draft) = self.store.get(id)? else {
                    debug!(draft_id = id, "requested draft does not exist");
                    return Ok(None);
                };
                if !draft.stage.is_processable() {
                    debug!(draft_id = id, stage = %draft.stage, "requested draft has no step left");
                    return Ok(None);
                }
                Ok(Some(Candidate {
                    draft_id: id.to_string(),
                    explicit: true,
                }))
            }
            None => {
                let now = self.now();
                let id = self.store.next_candidate(now, self.stale_before(now))?;
                Ok(id.map(|draft_id| Candidate {
                    draft_id,
                    explicit: false,
                }))
            }
        }
    }

    /// The exclusion guarantee. Returns the claimed draft, or `None` when
    /// another worker got there first or the draft is no longer processable.
    pub fn claim(&self, candidate: &Candidate) -> Result<Option<Draft>, PipelineError> {
        let now = self.now();
        let claimed = self.store.try_claim(
            &candidate.draft_id,
            self.worker.as_str(),
            now,
            self.stale_before(now),
            !candidate.explicit,
        )?;
        if !claimed {
            debug!(
                draft_id = %candidate.draft_id,
                worker = %self.worker,
                "claim matched no row"
            );
            return Ok(None);
        }
        let draft = self.store.get(&candidate.draft_id)?;
        if let Some(draft) = &draft {
            debug!(draft_id = %draft.id, worker = %self.worker, stage = %draft.stage, "claimed draft");
        }
        Ok(draft)
    }

    /// Single non-blocking attempt: select, then claim.
    pub fn acquire(&self, draft_id: Option<&str>) -> Result<Option<Draft>, PipelineError> {
        match self.candidate(draft_id)? {
            Some(candidate) => self.claim(&candidate),
            None => Ok(None),
        }
    }

    fn lost(&self, draft_id: &str) -> PipelineError {
        warn!(draft_id, worker = %self.worker, "lock lost before release");
        PipelineError::LockLost {
            draft_id: draft_id.to_string(),
            worker: self.worker.to_string(),
        }
    }

    /// Success path: drop the lock and the retry bookkeeping.
    pub fn release_success(&self, draft_id: &str) -> Result<(), PipelineError> {
        if self
            .store
            .release(draft_id, self.worker.as_str(), true, self.now())?
        {
            Ok(())
        } else {
            Err(self.lost(draft_id))
        }
    }

    /// Transient failure path: keep the stage, schedule the retry, unlock.
    pub fn release_for_retry(
        &self,
        draft_id: &str,
        attempts: u32,
        retry_at: DateTime<Utc>,
        diagnostics: &Diagnostics,
    ) -> Result<(), PipelineError> {
        if self.store.schedule_retry(
            draft_id,
            self.worker.as_str(),
            attempts,
            retry_at,
            diagnostics,
            self.now(),
        )? {
            Ok(())
        } else {
            Err(self.lost(draft_id))
        }
    }

    /// Terminal failure path: mark `FAILED`, unlock.
    pub fn release_failed(
        &self,
        draft_id: &str,
        attempts: u32,
        diagnostics: &Diagnostics,
    ) -> Result<(), PipelineError> {
        if self.store.mark_failed(
            draft_id,
            self.worker.as_str(),
            attempts,
            diagnostics,
            self.now(),
        )? {
            Ok(())
        } else {
            Err(self.lost(draft_id))
        }
    }

    /// Operator action for a lock stranded by a crash.
    pub fn force_release(&self, draft_id: &str) -> Result<bool, PipelineError> {
        let released = self.store.force_release(draft_id, self.now())?;
        if released {
            info!(draft_id, "lock force-released");
        }
        Ok(released)
    }
}
