//! SQLite-backed draft store.
//!
//! Every write a worker makes after claiming a draft is conditioned on
//! `locked_by` still naming that worker; a write that matches no row means
//! the claim was lost and is reported as `false`.

mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::draft::{Diagnostics, Draft, SourceItem, Stage, Validation};
use crate::error::{ErrorCode, PipelineError};

/// SQL list of processable stages, kept in step with [`crate::draft::PROCESSABLE`].
const PROCESSABLE_SQL: &str = "('NEW', 'QUEUED', 'STAGE1_DONE', 'STAGE2_DONE')";

const COLUMNS: &str = "id, title, source_link, category, raw_content, stage,
    stage1_output, stage2_output, final_output, locked_at, locked_by, attempts,
    next_retry_at, last_error, error_stage, error_code, error_message,
    validation_passed, validation_failures, validation_warnings, created_at, updated_at";

/// Output written by a successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageWrite {
    Composed { output: String },
    Revised { output: String },
    Finalized { output: String, validation: Validation },
}

impl StageWrite {
    /// Stage the draft must currently be in for this write to apply.
    fn from_stages(&self) -> &'static str {
        match self {
            StageWrite::Composed { .. } => "('NEW', 'QUEUED')",
            StageWrite::Revised { .. } => "('STAGE1_DONE')",
            StageWrite::Finalized { .. } => "('STAGE2_DONE')",
        }
    }

    pub fn target(&self) -> Stage {
        match self {
            StageWrite::Composed { .. } => Stage::Stage1Done,
            StageWrite::Revised { .. } => Stage::Stage2Done,
            StageWrite::Finalized { .. } => Stage::Saved,
        }
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Out-of-range values are reported against column `idx` rather than read
/// as the epoch, which would make a held lock look stale.
fn from_ms(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {ms} out of range").into(),
        )
    })
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_ms(idx, row.get(idx)?)
}

fn opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| from_ms(idx, ms))
        .transpose()
}

fn parse_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn draft_from_row(row: &Row<'_>) -> rusqlite::Result<Draft> {
    let stage_text: String = row.get(5)?;
    let stage = stage_text
        .parse::<Stage>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    let validation = row
        .get::<_, Option<bool>>(17)?
        .map(|passed| -> rusqlite::Result<Validation> {
            Ok(Validation {
                passed,
                failures: parse_list(row.get(18)?),
                warnings: parse_list(row.get(19)?),
            })
        })
        .transpose()?;

    Ok(Draft {
        id: row.get(0)?,
        source: SourceItem {
            title: row.get(1)?,
            source_link: row.get(2)?,
            category: row.get(3)?,
            raw_content: row.get(4)?,
        },
        stage,
        stage1_output: row.get(6)?,
        stage2_output: row.get(7)?,
        final_output: row.get(8)?,
        locked_at: opt_timestamp(row, 9)?,
        locked_by: row.get(10)?,
        attempts: row.get(11)?,
        next_retry_at: opt_timestamp(row, 12)?,
        diagnostics: Diagnostics {
            last_error: row.get(13)?,
            error_stage: row
                .get::<_, Option<String>>(14)?
                .and_then(|s| s.parse().ok()),
            error_code: row
                .get::<_, Option<String>>(15)?
                .and_then(|s| ErrorCode::parse(&s)),
            error_message: row.get(16)?,
        },
        validation,
        created_at: timestamp(row, 20)?,
        updated_at: timestamp(row, 21)?,
    })
}

#[derive(Clone)]
pub struct DraftStore {
    conn: Arc<Mutex<Connection>>,
}

impl DraftStore {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, PipelineError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PipelineError> {
        schema::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ingestion entry point: a new draft in stage `NEW`.
    pub fn insert(&self, source: &SourceItem, now: DateTime<Utc>) -> Result<Draft, PipelineError> {
        let id = Uuid::new_v4().to_string();
        self.conn().execute(
            "INSERT INTO drafts (id, title, source_link, category, raw_content, stage, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'NEW', ?6, ?6)",
            params![
                id,
                source.title,
                source.source_link,
                source.category,
                source.raw_content,
                to_ms(now)
            ],
        )?;
        self.get(&id)?
            .ok_or_else(|| PipelineError::DraftNotFound(id))
    }

    pub fn get(&self, id: &str) -> Result<Option<Draft>, PipelineError> {
        let draft = self
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM drafts WHERE id = ?1"),
                params![id],
                draft_from_row,
            )
            .optional()?;
        Ok(draft)
    }

    /// Most recently created drafts first.
    pub fn list(&self, limit: usize) -> Result<Vec<Draft>, PipelineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM drafts ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let drafts = stmt
            .query_map(params![limit as i64], draft_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(drafts)
    }

    pub fn count_by_stage(&self) -> Result<Vec<(Stage, u32)>, PipelineError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT stage, COUNT(*) FROM drafts GROUP BY stage ORDER BY stage")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(stage, n)| stage.parse().ok().map(|s| (s, n)))
            .collect())
    }

    /// Move a `NEW` draft to `QUEUED`.
    pub fn queue(&self, id: &str, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let changed = self.conn().execute(
            "UPDATE drafts SET stage = 'QUEUED', updated_at = ?2 WHERE id = ?1 AND stage = 'NEW'",
            params![id, to_ms(now)],
        )?;
        Ok(changed == 1)
    }

    /// Advisory pick of the oldest processable, free and due draft. Another
    /// worker may claim it before the caller does.
    pub fn next_candidate(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<String>, PipelineError> {
        let id = self
            .conn()
            .query_row(
                &format!(
                    "SELECT id FROM drafts
                     WHERE stage IN {PROCESSABLE_SQL}
                       AND (locked_at IS NULL OR locked_at < ?1)
                       AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT 1"
                ),
                params![to_ms(stale_before), to_ms(now)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Atomic claim: a single conditional update that succeeds for at most
    /// one caller. Locks stamped before `stale_before` count as free.
    pub fn try_claim(
        &self,
        id: &str,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        respect_backoff: bool,
    ) -> Result<bool, PipelineError> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE drafts SET locked_at = ?3, locked_by = ?2, updated_at = ?3
                 WHERE id = ?1
                   AND stage IN {PROCESSABLE_SQL}
                   AND (locked_at IS NULL OR locked_at < ?4)
                   AND (?5 = 0 OR next_retry_at IS NULL OR next_retry_at <= ?3)"
            ),
            params![id, worker, to_ms(now), to_ms(stale_before), respect_backoff],
        )?;
        Ok(changed == 1)
    }

    /// Clear the lock. With `clear_retry_state` the retry bookkeeping goes too.
    pub fn release(
        &self,
        id: &str,
        worker: &str,
        clear_retry_state: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let sql = if clear_retry_state {
            "UPDATE drafts SET locked_at = NULL, locked_by = NULL, attempts = 0,
                 next_retry_at = NULL, last_error = NULL, updated_at = ?3
             WHERE id = ?1 AND locked_by = ?2"
        } else {
            "UPDATE drafts SET locked_at = NULL, locked_by = NULL, updated_at = ?3
             WHERE id = ?1 AND locked_by = ?2"
        };
        let changed = self.conn().execute(sql, params![id, worker, to_ms(now)])?;
        Ok(changed == 1)
    }

    /// Operator override for a lock left behind by a crashed worker.
    pub fn force_release(&self, id: &str, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let changed = self.conn().execute(
            "UPDATE drafts SET locked_at = NULL, locked_by = NULL, updated_at = ?2
             WHERE id = ?1 AND locked_at IS NOT NULL",
            params![id, to_ms(now)],
        )?;
        Ok(changed == 1)
    }

    /// Persist a step's output, advance the stage and clear diagnostics.
    /// The lock stays held; the caller releases it.
    pub fn record_success(
        &self,
        id: &str,
        worker: &str,
        write: &StageWrite,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let from = write.from_stages();
        let target = write.target().as_str();
        let clear = "last_error = NULL, error_stage = NULL, error_code = NULL, error_message = NULL";
        let conn = self.conn();
        let changed = match write {
            StageWrite::Composed { output } => conn.execute(
                &format!(
                    "UPDATE drafts SET stage1_output = ?3, stage = ?4, {clear}, updated_at = ?5
                     WHERE id = ?1 AND locked_by = ?2 AND stage IN {from}"
                ),
                params![id, worker, output, target, to_ms(now)],
            )?,
            StageWrite::Revised { output } => conn.execute(
                &format!(
                    "UPDATE drafts SET stage2_output = ?3, stage = ?4, {clear}, updated_at = ?5
                     WHERE id = ?1 AND locked_by = ?2 AND stage IN {from}"
                ),
                params![id, worker, output, target, to_ms(now)],
            )?,
            StageWrite::Finalized { output, validation } => conn.execute(
                &format!(
                    "UPDATE drafts SET final_output = ?3, stage = ?4, {clear},
                         validation_passed = ?6, validation_failures = ?7,
                         validation_warnings = ?8, updated_at = ?5
                     WHERE id = ?1 AND locked_by = ?2 AND stage IN {from}"
                ),
                params![
                    id,
                    worker,
                    output,
                    target,
                    to_ms(now),
                    validation.passed,
                    serde_json::to_string(&validation.failures)?,
                    serde_json::to_string(&validation.warnings)?
                ],
            )?,
        };
        Ok(changed == 1)
    }

    /// Keep the stage, record the failure and schedule the next attempt.
    /// Releases the lock in the same update.
    pub fn schedule_retry(
        &self,
        id: &str,
        worker: &str,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        diagnostics: &Diagnostics,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let changed = self.conn().execute(
            "UPDATE drafts SET attempts = ?3, next_retry_at = ?4,
                 last_error = ?5, error_stage = ?6, error_code = ?7, error_message = ?8,
                 locked_at = NULL, locked_by = NULL, updated_at = ?9
             WHERE id = ?1 AND locked_by = ?2",
            params![
                id,
                worker,
                attempts,
                to_ms(next_retry_at),
                diagnostics.last_error,
                diagnostics.error_stage.map(Stage::as_str),
                diagnostics.error_code.map(ErrorCode::as_str),
                diagnostics.error_message,
                to_ms(now)
            ],
        )?;
        Ok(changed == 1)
    }

    /// Terminal failure: stage `FAILED`, no retry pending, lock released.
    pub fn mark_failed(
        &self,
        id: &str,
        worker: &str,
        attempts: u32,
        diagnostics: &Diagnostics,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let changed = self.conn().execute(
            "UPDATE drafts SET stage = 'FAILED', attempts = ?3, next_retry_at = NULL,
                 last_error = ?4, error_stage = ?5, error_code = ?6, error_message = ?7,
                 locked_at = NULL, locked_by = NULL, updated_at = ?8
             WHERE id = ?1 AND locked_by = ?2",
            params![
                id,
                worker,
                attempts,
                diagnostics.last_error,
                diagnostics.error_stage.map(Stage::as_str),
                diagnostics.error_code.map(ErrorCode::as_str),
                diagnostics.error_message,
                to_ms(now)
            ],
        )?;
        Ok(changed == 1)
    }

    /// Test hook for setting up drafts in arbitrary states.
    #[cfg(test)]
    pub(crate) fn execute(&self, sql: &str, params: impl rusqlite::Params) -> usize {
        self.conn().execute(sql, params).unwrap()
    }
}
