//! Error taxonomy shared by the pipeline stages and the orchestrator.

use thiserror::Error;

/// Semantic error kinds surfaced by pipeline stages and storage layers.
///
/// The orchestrator classifies these at segment boundaries: transient kinds
/// are retried with backoff, the rest terminate the job.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or malformed caller input (non-PDF upload, bad options JSON).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The document has no usable text layer.
    #[error("parse error: {0}")]
    Parse(String),

    /// Timeout or server-side failure from an embedding backend.
    #[error("embedding backend unavailable: {0}")]
    EmbeddingTransient(String),

    /// JobStore/SegmentStore I/O failure that may clear on retry.
    #[error("storage unavailable: {0}")]
    StorageTransient(String),

    /// A segment or job deadline was exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The job was cancelled cooperatively.
    #[error("cancelled")]
    Cancelled,

    /// Any unexpected failure; details are logged server-side only.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the orchestrator may retry the failed segment.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingTransient(_) | Self::StorageTransient(_)
        )
    }

    /// Stable machine-readable reason recorded on failed jobs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Parse(_) => "parse",
            Self::EmbeddingTransient(_) => "embedding",
            Self::StorageTransient(_) => "storage",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StorageTransient(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("artifact serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(PipelineError::EmbeddingTransient("503".into()).is_transient());
        assert!(PipelineError::StorageTransient("busy".into()).is_transient());
        assert!(!PipelineError::Parse("no text layer".into()).is_transient());
        assert!(!PipelineError::Cancelled.is_transient());
    }

    #[test]
    fn reasons_are_stable() {
        assert_eq!(PipelineError::Timeout("job".into()).reason(), "timeout");
        assert_eq!(
            PipelineError::Internal("boom".into()).reason(),
            "internal_error"
        );
    }
}
