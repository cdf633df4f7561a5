// Completed-jobs log: terminal job records, queryable by id after they leave the queue.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{db_error, sql_int, Database};
use modelhost_types::{JobKind, JobStatus, ProcessingJob};

/// Terminal job as stored in `job_history`.
pub type JobHistoryRecord = ProcessingJob;

fn to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ProcessingJob> {
    let status: String = row.get("status")?;
    let output: Option<String> = row.get("output")?;
    let progress: i64 = row.get("progress")?;
    let cost: i64 = row.get("cost")?;
    Ok(ProcessingJob {
        id: row.get("id")?,
        kind: JobKind {
            operation: row.get("operation")?,
            model: row.get("model")?,
        },
        // Only terminal states are ever written, anything unreadable maps to Error.
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Error),
        progress: progress.clamp(0, 100) as u8,
        cost: cost.max(0) as u64,
        submitted_at: from_millis(row.get("submitted_at")?),
        started_at: row.get::<_, Option<i64>>("started_at")?.map(from_millis),
        ended_at: row.get::<_, Option<i64>>("ended_at")?.map(from_millis),
        error_message: row.get("error_message")?,
        input: serde_json::Value::Null,
        output: output.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

impl Database {
    /// Store (or overwrite) the terminal record of a job.
    pub fn record_job(&self, job: &ProcessingJob) -> Result<(), String> {
        let output = job.output.as_ref().map(|v| v.to_string());
        let cost = sql_int(job.cost, "cost")?;
        self.connection()
            .execute(
                "INSERT OR REPLACE INTO job_history
                 (id, operation, model, status, cost, progress, submitted_at, started_at, ended_at, error_message, output)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id,
                    job.kind.operation,
                    job.kind.model,
                    job.status.as_str(),
                    cost,
                    i64::from(job.progress),
                    job.submitted_at.timestamp_millis(),
                    to_millis(job.started_at),
                    to_millis(job.ended_at),
                    job.error_message,
                    output,
                ],
            )
            .map_err(db_error("record job"))?;
        Ok(())
    }

    pub fn load_job(&self, id: &str) -> Result<Option<ProcessingJob>, String> {
        self.connection()
            .query_row(
                "SELECT * FROM job_history WHERE id = ?1",
                params![id],
                row_to_job,
            )
            .optional()
            .map_err(db_error("load job"))
    }

    /// Most recently finished jobs first.
    pub fn recent_jobs(&self, limit: usize) -> Result<Vec<ProcessingJob>, String> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare("SELECT * FROM job_history ORDER BY ended_at DESC LIMIT ?1")
            .map_err(db_error("prepare recent jobs"))?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], row_to_job)
            .map_err(db_error("query recent jobs"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(db_error("read recent jobs"))
    }

    pub fn count_jobs_with_status(&self, status: JobStatus) -> Result<usize, String> {
        let count: i64 = self
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM job_history WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(db_error("count jobs"))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelhost_types::JobRequest;

    fn finished_job(id: &str, status: JobStatus) -> ProcessingJob {
        let mut job = ProcessingJob::new(
            id.to_string(),
            JobRequest::new(JobKind::new("denoise", "rnnoise"), 4),
        );
        job.status = status;
        job.progress = 100;
        job.started_at = Some(Utc::now());
        job.ended_at = Some(Utc::now());
        job
    }

    #[test]
    fn test_record_and_load_job() {
        let db = Database::new(":memory:").unwrap();
        let mut job = finished_job("job-1", JobStatus::Completed);
        job.output = Some(serde_json::json!({ "frames": 12 }));

        db.record_job(&job).unwrap();
        let loaded = db.load_job("job-1").unwrap().unwrap();

        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.kind, job.kind);
        assert_eq!(loaded.cost, 4);
        assert_eq!(loaded.output, Some(serde_json::json!({ "frames": 12 })));
        assert_eq!(
            loaded.submitted_at.timestamp_millis(),
            job.submitted_at.timestamp_millis()
        );
    }

    #[test]
    fn test_missing_job_is_none() {
        let db = Database::new(":memory:").unwrap();
        assert!(db.load_job("nope").unwrap().is_none());
    }

    #[test]
    fn test_error_message_survives() {
        let db = Database::new(":memory:").unwrap();
        let mut job = finished_job("job-2", JobStatus::Error);
        job.error_message = Some("model unavailable".to_string());
        db.record_job(&job).unwrap();

        let loaded = db.load_job("job-2").unwrap().unwrap();
        assert_eq!(loaded.error_message.as_deref(), Some("model unavailable"));
        assert_eq!(db.count_jobs_with_status(JobStatus::Error).unwrap(), 1);
        assert_eq!(db.count_jobs_with_status(JobStatus::Completed).unwrap(), 0);
        assert_eq!(db.recent_jobs(10).unwrap().len(), 1);
        assert_eq!(db.recent_jobs(usize::MAX).unwrap().len(), 1);
    }

    #[test]
    fn test_oversized_cost_is_rejected() {
        let db = Database::new(":memory:").unwrap();
        let mut job = finished_job("job-3", JobStatus::Completed);
        job.cost = u64::MAX;

        let err = db.record_job(&job).unwrap_err();
        assert!(err.contains("cost"), "{err}");
        assert!(db.load_job("job-3").unwrap().is_none());
    }
}
