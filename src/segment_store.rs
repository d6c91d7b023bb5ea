//! SQLite persistence for per-segment intermediate artifacts.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::PipelineError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS segment_artifacts (
    key TEXT PRIMARY KEY,
    value_blob BLOB NOT NULL,
    created_at TEXT NOT NULL
);
";

/// Content-addressed artifact store keyed by `(doc_id, segment_id)` for
/// per-document segments and `(job_id, segment_id)` for pair segments.
///
/// Re-runs overwrite atomically; keys are stable so re-uploading the same
/// document can reuse its early segments.
#[derive(Clone)]
pub struct SegmentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SegmentStore {
    /// Opens (and migrates) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        Self::prepare(Connection::open(path)?)
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

    /// Key for a per-document segment.
    pub fn doc_key(doc_id: &str, segment: u32) -> String {
        format!("doc:{doc_id}:{segment:02}")
    }

    /// Key for a pair segment.
    pub fn job_key(job_id: &str, segment: u32) -> String {
        format!("job:{job_id}:{segment:02}")
    }

    /// Serializes and stores an artifact, replacing any previous value.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PipelineError> {
        let blob = serde_json::to_vec(value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO segment_artifacts (key, value_blob, created_at)
             VALUES (?1, ?2, ?3)",
            params![key, blob, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Loads and deserializes an artifact.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PipelineError> {
        let conn = self.conn.lock().await;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value_blob FROM segment_artifacts WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drops every artifact for a document.
    pub async fn delete_doc(&self, doc_id: &str) -> Result<(), PipelineError> {
        self.delete_prefix(&format!("doc:{doc_id}:")).await
    }

    /// Drops every artifact for a job.
    pub async fn delete_job(&self, job_id: &str) -> Result<(), PipelineError> {
        self.delete_prefix(&format!("job:{job_id}:")).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM segment_artifacts WHERE key LIKE ?1 || '%'",
            params![prefix],
        )?;
        Ok(())
    }
}
