// Database schema definitions

use super::db_error;
use rusqlite::Connection;

const CREATE_JOB_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_history (
    id TEXT PRIMARY KEY,
    operation TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL,
    cost INTEGER NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    submitted_at INTEGER NOT NULL,
    started_at INTEGER,
    ended_at INTEGER,
    error_message TEXT,
    output TEXT
)
"#;

const CREATE_JOB_HISTORY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_job_history_ended
ON job_history(ended_at)
"#;

const CREATE_LEDGER_JOURNAL_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_journal (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

/// Create all tables and indexes if they don't exist yet
pub fn initialize(conn: &Connection) -> Result<(), String> {
    for statement in [
        CREATE_JOB_HISTORY_TABLE,
        CREATE_JOB_HISTORY_INDEX,
        CREATE_LEDGER_JOURNAL_TABLE,
    ] {
        conn.execute(statement, [])
            .map_err(db_error("initialize schema"))?;
    }
    Ok(())
}
