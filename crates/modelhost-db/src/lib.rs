// SQLite persistence for the model host.
// Terminal job records and the credit journal live here; everything else is in memory.

pub mod history;
pub mod journal;
pub mod schema;

use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};

pub use history::JobHistoryRecord;
pub use journal::{JournalEntry, JournalKind};

/// Database wrapper serializing access to a single connection
pub struct Database {
    conn: Mutex<Connection>,
}

/// Shared database type for passing across async boundaries
pub type SharedDatabase = Arc<Database>;

/// Helper function to create standardized database error messages
///
/// Usage: `.map_err(db_error("record job"))?`
pub fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> String + '_ {
    move |e| format!("Failed to {context}: {e}")
}

/// SQLite integers are signed; refuse values that would wrap negative.
pub fn sql_int(value: u64, field: &str) -> Result<i64, String> {
    i64::try_from(value).map_err(|_| format!("{field} {value} is too large to store"))
}

impl Database {
    /// Open (or create) the database and initialize the schema.
    /// Use `":memory:"` for a throwaway database.
    pub fn new(db_path: &str) -> Result<Self, String> {
        if db_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("Failed to create database directory: {e}"))?;
                }
            }
        }

        let conn = Connection::open(db_path).map_err(db_error("open database"))?;
        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the connection (locked). A poisoned lock is recovered, the
    /// connection itself holds no partial state across calls.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Get current timestamp in milliseconds since Unix epoch
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
