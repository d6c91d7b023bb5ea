//! Per-job progress topics with at-least-once fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::job::{Job, JobStatus};

/// Buffered frames per topic; slow subscribers see duplicates, never a
/// missing terminal frame.
const TOPIC_CAPACITY: usize = 64;

/// Frame kind on the progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// Snapshot sent to a (possibly late) subscriber.
    Initial,
    /// Live segment transition.
    Progress,
    /// Terminal success or cancellation.
    Final,
    /// Failure or retry notice.
    Error,
}

/// One message on a job's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    /// Frame kind.
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Job the frame belongs to.
    pub job_id: String,
    /// Job status at emission time.
    pub status: JobStatus,
    /// Current segment id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<u32>,
    /// Current segment name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_name: Option<String>,
    /// Percentage complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<f64>,
    /// Failure detail, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl ProgressFrame {
    fn from_job(frame_type: FrameType, job: &Job) -> Self {
        Self {
            frame_type,
            job_id: job.job_id.clone(),
            status: job.status,
            segment: Some(job.current_segment),
            segment_name: Some(job.current_segment_name.clone()),
            progress_pct: Some(job.progress_pct),
            error_message: job.error_message.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Snapshot frame for a new subscriber.
    pub fn initial(job: &Job) -> Self {
        Self::from_job(FrameType::Initial, job)
    }

    /// Live transition frame.
    pub fn progress(job: &Job) -> Self {
        Self::from_job(FrameType::Progress, job)
    }

    /// Terminal frame for COMPLETED and CANCELLED jobs.
    pub fn terminal(job: &Job) -> Self {
        Self::from_job(FrameType::Final, job)
    }

    /// Error frame; terminal when the job status is terminal.
    pub fn error(job: &Job, message: &str) -> Self {
        let mut frame = Self::from_job(FrameType::Error, job);
        frame.error_message = Some(message.to_string());
        frame
    }

    /// Whether this frame closes the stream.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Publish/subscribe bus multiplexing per-job progress topics.
///
/// Only the worker owning a job publishes for it; any number of subscribers
/// may listen. Delivery is at-least-once: subscribers deduplicate by
/// `(segment, status)` monotonicity.
#[derive(Clone, Default)]
pub struct ProgressBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<ProgressFrame>>>>,
}

impl ProgressBus {
    /// Builds an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a frame; the topic is dropped after its terminal frame.
    pub async fn publish(&self, frame: ProgressFrame) {
        let mut topics = self.topics.lock().await;
        let terminal = frame.is_terminal();
        let job_id = frame.job_id.clone();
        let sender = topics
            .entry(job_id.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        // A send error only means nobody is listening right now.
        let _ = sender.send(frame);
        if terminal {
            topics.remove(&job_id);
        }
    }

    /// Subscribes to a job's topic.
    ///
    /// Callers send the `initial` snapshot themselves from the job record;
    /// frames published after this call are delivered live.
    pub async fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressFrame> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Number of live topics; used by tests and shutdown checks.
    pub async fn topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CompareOptions;

    fn job(status: JobStatus, segment: u32) -> Job {
        let mut job = Job::new(
            "job-1".into(),
            "docaaaa".into(),
            "docbbbb".into(),
            None,
            None,
            CompareOptions::default(),
        );
        job.status = status;
        job.current_segment = segment;
        job
    }

    #[tokio::test(flavor = "current_thread")]
    async fn subscribers_see_frames_in_order() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe("job-1").await;

        bus.publish(ProgressFrame::progress(&job(JobStatus::Running, 1)))
            .await;
        bus.publish(ProgressFrame::progress(&job(JobStatus::Running, 2)))
            .await;

        assert_eq!(rx.recv().await.unwrap().segment, Some(1));
        assert_eq!(rx.recv().await.unwrap().segment, Some(2));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn terminal_frame_closes_topic() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe("job-1").await;
        bus.publish(ProgressFrame::terminal(&job(JobStatus::Completed, 11)))
            .await;
        let frame = rx.recv().await.unwrap();
        assert!(frame.is_terminal());
        assert_eq!(frame.frame_type, FrameType::Final);
        assert_eq!(bus.topic_count().await, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn publishing_without_subscribers_is_fine() {
        let bus = ProgressBus::new();
        bus.publish(ProgressFrame::progress(&job(JobStatus::Running, 3)))
            .await;
        // Late subscriber re-syncs from the job record, then gets live frames.
        let mut rx = bus.subscribe("job-1").await;
        bus.publish(ProgressFrame::progress(&job(JobStatus::Running, 4)))
            .await;
        assert_eq!(rx.recv().await.unwrap().segment, Some(4));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn error_frames_carry_the_message() {
        let mut failed = job(JobStatus::Failed, 9);
        failed.error_message = Some("storage".into());
        let frame = ProgressFrame::error(&failed, "storage unavailable");
        assert_eq!(frame.frame_type, FrameType::Error);
        assert!(frame.is_terminal());
        assert_eq!(frame.error_message.as_deref(), Some("storage unavailable"));
    }
}
