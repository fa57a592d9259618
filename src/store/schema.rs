use rusqlite::Connection;

/// Drafts table. Timestamps are unix milliseconds; `stage` and `error_code`
/// hold their persisted names; validation lists are JSON arrays.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS drafts (
    id                  TEXT PRIMARY KEY,
    title               TEXT NOT NULL,
    source_link         TEXT NOT NULL DEFAULT '',
    category            TEXT NOT NULL DEFAULT '',
    raw_content         TEXT NOT NULL DEFAULT '',
    stage               TEXT NOT NULL DEFAULT 'NEW',
    stage1_output       TEXT,
    stage2_output       TEXT,
    final_output        TEXT,
    locked_at           INTEGER,
    locked_by           TEXT,
    attempts            INTEGER NOT NULL DEFAULT 0,
    next_retry_at       INTEGER,
    last_error          TEXT,
    error_stage         TEXT,
    error_code          TEXT,
    error_message       TEXT,
    validation_passed   INTEGER,
    validation_failures TEXT,
    validation_warnings TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_drafts_pick ON drafts (stage, locked_at, created_at);
";

pub(super) fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
