//! Job records and the segment table driven by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::options::CompareOptions;

/// Number of working segments; segment 0 is the queued placeholder.
pub const TOTAL_SEGMENTS: u32 = 11;

/// Fixed segment names, indexed by segment id.
pub const SEGMENT_NAMES: [&str; 12] = [
    "Queued",
    "Document A: Layout Analysis",
    "Document A: Definitions Extraction",
    "Document A: Clause Classification",
    "Document A: Clause DNA Extraction",
    "Document B: Layout Analysis",
    "Document B: Definitions Extraction",
    "Document B: Clause Classification",
    "Document B: Clause DNA Extraction",
    "Semantic Alignment",
    "Delta Interpretation",
    "Narrative Summarisation",
];

/// Name for a segment id, clamped to the table.
pub fn segment_name(segment: u32) -> &'static str {
    SEGMENT_NAMES[(segment as usize).min(SEGMENT_NAMES.len() - 1)]
}

/// Percentage complete when a segment starts.
pub fn progress_pct(segment: u32) -> f64 {
    (f64::from(segment.min(TOTAL_SEGMENTS)) / f64::from(TOTAL_SEGMENTS) * 1000.0).round() / 10.0
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Created, not yet queued.
    Pending,
    /// Waiting for a worker.
    Queued,
    /// A worker is driving segments.
    Running,
    /// Backing off after a transient segment failure.
    Retrying,
    /// Finished with a stored result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped on caller request.
    Cancelled,
}

impl JobStatus {
    /// Wire-stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Retrying => "RETRYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parses the stored label.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "RETRYING" => Some(Self::Retrying),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Mutable job record; only the orchestrator writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier.
    pub job_id: String,
    /// Content-addressed id of document A.
    pub doc_id_a: String,
    /// Content-addressed id of document B.
    pub doc_id_b: String,
    /// Original upload name of document A.
    pub file_name_a: Option<String>,
    /// Original upload name of document B.
    pub file_name_b: Option<String>,
    /// Current status.
    pub status: JobStatus,
    /// Segment currently running (or last reached), 0-11.
    pub current_segment: u32,
    /// Display name for the current segment.
    pub current_segment_name: String,
    /// Percentage complete, `[0, 100]`.
    pub progress_pct: f64,
    /// Failure detail when status is FAILED.
    pub error_message: Option<String>,
    /// Where the stored result lives, once one exists.
    pub result_pointer: Option<String>,
    /// Comparison options captured at submission.
    pub options: CompareOptions,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First pick-up time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a fresh PENDING record.
    pub fn new(
        job_id: String,
        doc_id_a: String,
        doc_id_b: String,
        file_name_a: Option<String>,
        file_name_b: Option<String>,
        options: CompareOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            doc_id_a,
            doc_id_b,
            file_name_a,
            file_name_b,
            status: JobStatus::Pending,
            current_segment: 0,
            current_segment_name: segment_name(0).to_string(),
            progress_pct: 0.0,
            error_message: None,
            result_pointer: None,
            options,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotone_over_segments() {
        let mut last = -1.0;
        for segment in 0..=TOTAL_SEGMENTS {
            let pct = progress_pct(segment);
            assert!(pct > last);
            assert!((0.0..=100.0).contains(&pct));
            last = pct;
        }
        assert_eq!(progress_pct(0), 0.0);
        assert_eq!(progress_pct(TOTAL_SEGMENTS), 100.0);
    }

    #[test]
    fn segment_names_cover_the_chain() {
        assert_eq!(segment_name(0), "Queued");
        assert_eq!(segment_name(9), "Semantic Alignment");
        assert_eq!(segment_name(11), "Narrative Summarisation");
        assert_eq!(segment_name(99), "Narrative Summarisation");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Retrying,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }
}
