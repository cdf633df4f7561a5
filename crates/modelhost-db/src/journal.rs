// Append-only credit journal. One row per ledger movement.

use rusqlite::params;

use super::{current_timestamp_millis, db_error, sql_int, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    Hold,
    Release,
    Debit,
    Refund,
    TopUp,
}

impl JournalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalKind::Hold => "hold",
            JournalKind::Release => "release",
            JournalKind::Debit => "debit",
            JournalKind::Refund => "refund",
            JournalKind::TopUp => "top_up",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "hold" => Some(JournalKind::Hold),
            "release" => Some(JournalKind::Release),
            "debit" => Some(JournalKind::Debit),
            "refund" => Some(JournalKind::Refund),
            "top_up" => Some(JournalKind::TopUp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub job_id: Option<String>,
    pub kind: JournalKind,
    pub amount: u64,
    pub balance_after: u64,
}

impl Database {
    pub fn append_journal(&self, entry: &JournalEntry) -> Result<(), String> {
        let amount = sql_int(entry.amount, "amount")?;
        let balance_after = sql_int(entry.balance_after, "balance")?;
        self.connection()
            .execute(
                "INSERT INTO ledger_journal (job_id, kind, amount, balance_after, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.job_id,
                    entry.kind.as_str(),
                    amount,
                    balance_after,
                    current_timestamp_millis(),
                ],
            )
            .map_err(db_error("append journal entry"))?;
        Ok(())
    }

    /// Journal entries for one job, oldest first.
    pub fn journal_for_job(&self, job_id: &str) -> Result<Vec<JournalEntry>, String> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(
                "SELECT job_id, kind, amount, balance_after FROM ledger_journal
                 WHERE job_id = ?1 ORDER BY seq",
            )
            .map_err(db_error("prepare journal query"))?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                let kind: String = row.get(1)?;
                let amount: i64 = row.get(2)?;
                let balance_after: i64 = row.get(3)?;
                Ok((row.get::<_, Option<String>>(0)?, kind, amount, balance_after))
            })
            .map_err(db_error("query journal"))?;

        let mut entries = Vec::new();
        for row in rows {
            let (job_id, kind, amount, balance_after) = row.map_err(db_error("read journal"))?;
            let Some(kind) = JournalKind::parse(&kind) else {
                continue;
            };
            entries.push(JournalEntry {
                job_id,
                kind,
                amount: amount.max(0) as u64,
                balance_after: balance_after.max(0) as u64,
            });
        }
        Ok(entries)
    }
}
