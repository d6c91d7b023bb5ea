//! SQLite persistence for job records and uploaded document bytes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::PipelineError;
use crate::job::{progress_pct, segment_name, Job, JobStatus};
use crate::options::CompareOptions;
use crate::pipeline::ComparisonResult;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    doc_id_a TEXT NOT NULL,
    doc_id_b TEXT NOT NULL,
    file_name_a TEXT,
    file_name_b TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    current_segment INTEGER NOT NULL DEFAULT 0,
    current_segment_name TEXT NOT NULL DEFAULT 'Queued',
    progress_pct REAL NOT NULL DEFAULT 0.0,
    error_message TEXT,
    result_data TEXT,
    options_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at DESC);
CREATE TABLE IF NOT EXISTS documents (
    doc_id TEXT PRIMARY KEY,
    file_name TEXT,
    bytes BLOB NOT NULL,
    created_at TEXT NOT NULL
);
";

const TERMINAL_GUARD: &str = "status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')";

/// Job persistence with single-writer semantics per job id.
///
/// Claim transitions are compare-and-set on the current status and terminal
/// statuses are guarded write-once, so a second worker picking up the same
/// job id observes a no-op.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Opens (and migrates) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let conn = Connection::open(path)?;
        Self::prepare(conn)
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory() -> Result<Self, PipelineError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, PipelineError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts a fresh job record.
    pub async fn create(&self, job: &Job) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs (
                job_id, doc_id_a, doc_id_b, file_name_a, file_name_b,
                status, current_segment, current_segment_name, progress_pct,
                options_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.job_id,
                job.doc_id_a,
                job.doc_id_b,
                job.file_name_a,
                job.file_name_b,
                job.status.as_str(),
                job.current_segment,
                job.current_segment_name,
                job.progress_pct,
                serde_json::to_string(&job.options)?,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetches a job by id.
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, PipelineError> {
        let conn = self.conn.lock().await;
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE job_id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// PENDING to QUEUED transition.
    pub async fn mark_queued(&self, job_id: &str) -> Result<bool, PipelineError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'QUEUED', updated_at = ?2
             WHERE job_id = ?1 AND status = 'PENDING'",
            params![job_id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Compare-and-set pick-up: QUEUED to RUNNING.
    ///
    /// Returns false when another worker got there first or the job is in
    /// any other state, making duplicate pick-up a no-op.
    pub async fn claim(&self, job_id: &str) -> Result<bool, PipelineError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'RUNNING', started_at = ?2, updated_at = ?2
             WHERE job_id = ?1 AND status = 'QUEUED'",
            params![job_id, now],
        )?;
        Ok(changed > 0)
    }

    /// Writes segment/status progress; terminal rows are never overwritten.
    pub async fn update_progress(
        &self,
        job_id: &str,
        status: JobStatus,
        segment: u32,
        error_message: Option<&str>,
    ) -> Result<Option<Job>, PipelineError> {
        let now = Utc::now().to_rfc3339();
        let completed_at = status.is_terminal().then(|| now.clone());
        {
            let conn = self.conn.lock().await;
            conn.execute(
                &format!(
                    "UPDATE jobs SET
                        status = ?2,
                        current_segment = ?3,
                        current_segment_name = ?4,
                        progress_pct = ?5,
                        error_message = COALESCE(?6, error_message),
                        completed_at = COALESCE(?7, completed_at),
                        updated_at = ?8
                     WHERE job_id = ?1 AND {TERMINAL_GUARD}"
                ),
                params![
                    job_id,
                    status.as_str(),
                    segment,
                    segment_name(segment),
                    progress_pct(segment),
                    error_message,
                    completed_at,
                    now,
                ],
            )?;
        }
        self.get(job_id).await
    }

    /// Stores the final result blob for a job.
    pub async fn set_result(
        &self,
        job_id: &str,
        result: &ComparisonResult,
    ) -> Result<(), PipelineError> {
        let blob = serde_json::to_string(result)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET result_data = ?2, updated_at = ?3 WHERE job_id = ?1",
            params![job_id, blob, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Loads the stored result for a job, when one exists.
    pub async fn get_result(
        &self,
        job_id: &str,
    ) -> Result<Option<ComparisonResult>, PipelineError> {
        let conn = self.conn.lock().await;
        let blob: Option<Option<String>> = conn
            .query_row(
                "SELECT result_data FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        match blob.flatten() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Lists jobs newest first, with the unpaged total for the filter.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Job>, usize), PipelineError> {
        let conn = self.conn.lock().await;
        let (jobs, total) = match status {
            Some(status) => {
                let mut statement = conn.prepare(
                    "SELECT * FROM jobs WHERE status = ?1
                     ORDER BY created_at DESC, job_id LIMIT ?2 OFFSET ?3",
                )?;
                let jobs = statement
                    .query_map(
                        params![status.as_str(), limit as i64, offset as i64],
                        row_to_job,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                    params![status.as_str()],
                    |row| row.get(0),
                )?;
                (jobs, total as usize)
            }
            None => {
                let mut statement = conn.prepare(
                    "SELECT * FROM jobs ORDER BY created_at DESC, job_id LIMIT ?1 OFFSET ?2",
                )?;
                let jobs = statement
                    .query_map(params![limit as i64, offset as i64], row_to_job)?
                    .collect::<Result<Vec<_>, _>>()?;
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
                (jobs, total as usize)
            }
        };
        Ok((jobs, total))
    }

    /// Stores uploaded bytes for the job's lifetime.
    pub async fn save_document(
        &self,
        doc_id: &str,
        file_name: Option<&str>,
        bytes: &[u8],
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO documents (doc_id, file_name, bytes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![doc_id, file_name, bytes, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Loads stored document bytes.
    pub async fn load_document(&self, doc_id: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let conn = self.conn.lock().await;
        let bytes = conn
            .query_row(
                "SELECT bytes FROM documents WHERE doc_id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes)
    }

    /// Drops document bytes once a job reaches a terminal state.
    pub async fn delete_documents(&self, doc_ids: &[&str]) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        for doc_id in doc_ids {
            conn.execute(
                "DELETE FROM documents WHERE doc_id = ?1",
                params![doc_id],
            )?;
        }
        Ok(())
    }

    /// Deletes terminal jobs older than the TTL, returning what was purged
    /// so callers can drop the matching segment artifacts.
    pub async fn purge_expired(
        &self,
        ttl: Duration,
    ) -> Result<Vec<PurgedJob>, PipelineError> {
        let cutoff = (Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default())
            .to_rfc3339();
        let conn = self.conn.lock().await;
        let purged = {
            let mut statement = conn.prepare(
                "SELECT job_id, doc_id_a, doc_id_b FROM jobs
                 WHERE status IN ('COMPLETED', 'FAILED', 'CANCELLED')
                   AND completed_at IS NOT NULL AND completed_at < ?1",
            )?;
            let rows = statement
                .query_map(params![cutoff], |row| {
                    Ok(PurgedJob {
                        job_id: row.get(0)?,
                        doc_id_a: row.get(1)?,
                        doc_id_b: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for job in &purged {
            conn.execute("DELETE FROM jobs WHERE job_id = ?1", params![job.job_id])?;
            conn.execute(
                "DELETE FROM documents WHERE doc_id IN (?1, ?2)",
                params![job.doc_id_a, job.doc_id_b],
            )?;
        }
        Ok(purged)
    }
}

/// Identity of a purged job, used to cascade artifact deletion.
#[derive(Debug, Clone)]
pub struct PurgedJob {
    /// Purged job id.
    pub job_id: String,
    /// Document A id.
    pub doc_id_a: String,
    /// Document B id.
    pub doc_id_b: String,
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status_raw: String = row.get("status")?;
    let options_raw: String = row.get("options_json")?;
    let result_data: Option<String> = row.get("result_data")?;
    let job_id: String = row.get("job_id")?;
    Ok(Job {
        doc_id_a: row.get("doc_id_a")?,
        doc_id_b: row.get("doc_id_b")?,
        file_name_a: row.get("file_name_a")?,
        file_name_b: row.get("file_name_b")?,
        status: JobStatus::parse(&status_raw).unwrap_or(JobStatus::Failed),
        current_segment: row.get("current_segment")?,
        current_segment_name: row.get("current_segment_name")?,
        progress_pct: row.get("progress_pct")?,
        error_message: row.get("error_message")?,
        result_pointer: result_data.map(|_| format!("jobs/{job_id}/result")),
        options: serde_json::from_str::<CompareOptions>(&options_raw).unwrap_or_default(),
        created_at: parse_timestamp(row, "created_at")?,
        started_at: parse_optional_timestamp(row, "started_at")?,
        completed_at: parse_optional_timestamp(row, "completed_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
        job_id,
    })
}

fn parse_timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    Ok(DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default())
}

fn parse_optional_timestamp(
    row: &Row<'_>,
    column: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    Ok(raw.and_then(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }))
}
