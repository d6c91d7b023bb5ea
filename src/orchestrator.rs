//! Job orchestration: a FIFO worker pool driving the 12-segment chain with
//! progress emission, retry, cooperative cancellation and timeouts.

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::embedder::{remote_config_from_env, select_backend};
use crate::error::PipelineError;
use crate::job::{Job, JobStatus};
use crate::job_store::JobStore;
use crate::layout::PageSource;
use crate::options::CompareOptions;
use crate::pipeline::{
    sort_matches, ComparisonResult, DocumentArtifacts, Pipeline, Timings,
};
use crate::progress::{ProgressBus, ProgressFrame};
use crate::segment_store::SegmentStore;

/// Orchestration tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent jobs per process.
    pub workers: usize,
    /// Retry attempts for transient segment failures.
    pub max_retries: u32,
    /// First retry backoff.
    pub retry_base: Duration,
    /// Backoff ceiling.
    pub retry_cap: Duration,
    /// Per-segment deadline.
    pub segment_soft_timeout: Duration,
    /// Whole-job deadline.
    pub job_hard_timeout: Duration,
    /// Retention window for terminal jobs.
    pub job_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 3,
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(120),
            segment_soft_timeout: Duration::from_secs(540),
            job_hard_timeout: Duration::from_secs(600),
            job_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Owns job mutation and drives the pipeline segment by segment.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    jobs: JobStore,
    segments: SegmentStore,
    bus: ProgressBus,
    source: Arc<dyn PageSource>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    queue_tx: mpsc::UnboundedSender<String>,
}

impl Orchestrator {
    /// Builds the orchestrator and spawns its worker pool.
    pub fn new(
        config: OrchestratorConfig,
        jobs: JobStore,
        segments: SegmentStore,
        bus: ProgressBus,
        source: Arc<dyn PageSource>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<String>();
        let inner = Arc::new(Inner {
            config,
            jobs,
            segments,
            bus,
            source,
            cancel_flags: Mutex::new(HashMap::new()),
            queue_tx,
        });
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker_id in 0..inner.config.workers.max(1) {
            let inner = Arc::clone(&inner);
            let queue_rx = Arc::clone(&queue_rx);
            tokio::spawn(async move {
                loop {
                    let next = { queue_rx.lock().await.recv().await };
                    let Some(job_id) = next else {
                        break;
                    };
                    tracing::debug!(worker_id, job_id = %job_id, "worker picked up job");
                    Inner::run_job(&inner, &job_id).await;
                }
            });
        }
        Self { inner }
    }

    /// Shared progress bus.
    pub fn bus(&self) -> &ProgressBus {
        &self.inner.bus
    }

    /// Job store handle for read-only consumers.
    pub fn jobs(&self) -> &JobStore {
        &self.inner.jobs
    }

    /// Accepts a comparison job: stores documents, creates the record and
    /// queues it FIFO. Returns the QUEUED job.
    pub async fn submit(
        &self,
        bytes_a: Vec<u8>,
        file_name_a: Option<String>,
        bytes_b: Vec<u8>,
        file_name_b: Option<String>,
        options: CompareOptions,
    ) -> Result<Job, PipelineError> {
        options.validate()?;
        let doc_id_a = crate::layout::doc_id_for(&bytes_a);
        let doc_id_b = crate::layout::doc_id_for(&bytes_b);
        self.inner
            .with_store_retry("document bytes", || {
                self.inner
                    .jobs
                    .save_document(&doc_id_a, file_name_a.as_deref(), &bytes_a)
            })
            .await?;
        self.inner
            .with_store_retry("document bytes", || {
                self.inner
                    .jobs
                    .save_document(&doc_id_b, file_name_b.as_deref(), &bytes_b)
            })
            .await?;

        let job_id = Uuid::new_v4().to_string();
        let job = Job::new(
            job_id.clone(),
            doc_id_a,
            doc_id_b,
            file_name_a,
            file_name_b,
            options,
        );
        self.inner
            .with_store_retry("job record", || self.inner.jobs.create(&job))
            .await?;
        self.inner
            .with_store_retry("job record", || self.inner.jobs.mark_queued(&job_id))
            .await?;

        let queued = self
            .inner
            .jobs
            .get(&job_id)
            .await?
            .ok_or_else(|| PipelineError::Internal("job vanished after create".into()))?;
        self.inner.bus.publish(ProgressFrame::progress(&queued)).await;

        self.inner
            .queue_tx
            .send(job_id)
            .map_err(|_| PipelineError::Internal("worker pool is shut down".into()))?;
        Ok(queued)
    }

    /// Requests cooperative cancellation.
    ///
    /// Queued jobs are cancelled immediately; running jobs stop at the next
    /// segment boundary. Terminal and unknown jobs report `false`.
    pub async fn cancel(&self, job_id: &str) -> Result<(bool, String), PipelineError> {
        let Some(job) = self.inner.jobs.get(job_id).await? else {
            return Ok((false, "job not found".to_string()));
        };
        if job.status.is_terminal() {
            return Ok((false, format!("job already {}", job.status.as_str())));
        }

        self.inner.flag_for(job_id).await.store(true, Ordering::Release);

        match job.status {
            JobStatus::Pending | JobStatus::Queued => {
                if let Some(cancelled) = self
                    .inner
                    .with_store_retry("terminal status", || {
                        self.inner.jobs.update_progress(
                            job_id,
                            JobStatus::Cancelled,
                            job.current_segment,
                            None,
                        )
                    })
                    .await?
                {
                    self.inner.bus.publish(ProgressFrame::terminal(&cancelled)).await;
                }
                self.inner.remove_flag(job_id).await;
                Ok((true, "job cancelled before execution".to_string()))
            }
            _ => Ok((true, "cancellation requested".to_string())),
        }
    }

    /// Drops expired terminal jobs together with their artifacts.
    pub async fn purge_expired(&self) -> Result<usize, PipelineError> {
        let purged = self.inner.jobs.purge_expired(self.inner.config.job_ttl).await?;
        for entry in &purged {
            self.inner.segments.delete_job(&entry.job_id).await?;
            self.inner.segments.delete_doc(&entry.doc_id_a).await?;
            self.inner.segments.delete_doc(&entry.doc_id_b).await?;
        }
        Ok(purged.len())
    }
}

impl Inner {
    /// Retries a store operation under the transient backoff policy.
    ///
    /// Segment bodies are CPU-bound, so the storage-transient class only
    /// ever surfaces from these reads and writes; they get the same
    /// backoff and attempt budget as segment work.
    async fn with_store_retry<T, F, Fut>(
        &self,
        what: &'static str,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(what, attempt, error = %err, "retrying store operation");
                    sleep(self.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Persists a segment artifact, retrying transient storage failures.
    async fn put_artifact<T: serde::Serialize>(
        &self,
        key: String,
        value: &T,
    ) -> Result<(), PipelineError> {
        self.with_store_retry("segment artifact", || self.segments.put(&key, value))
            .await
    }

    async fn flag_for(&self, job_id: &str) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.lock().await;
        Arc::clone(
            flags
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    async fn remove_flag(&self, job_id: &str) {
        self.cancel_flags.lock().await.remove(job_id);
    }

    /// Runs one job end to end; all failures are folded into the job row.
    async fn run_job(inner: &Arc<Inner>, job_id: &str) {
        let claimed = match inner
            .with_store_retry("job claim", || inner.jobs.claim(job_id))
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                tracing::error!(job_id, error = %err, "claim failed");
                return;
            }
        };
        if !claimed {
            // Cancelled while queued, already running elsewhere, or replayed.
            return;
        }

        let job = match inner
            .with_store_retry("job record", || inner.jobs.get(job_id))
            .await
        {
            Ok(Some(job)) => job,
            _ => return,
        };
        let flag = inner.flag_for(job_id).await;

        let outcome = timeout(
            inner.config.job_hard_timeout,
            inner.execute(&job, &flag),
        )
        .await
        .unwrap_or_else(|_| Err(PipelineError::Timeout("job hard timeout".into())));

        match outcome {
            Ok(result) => {
                if let Err(err) = inner
                    .with_store_retry("job result", || inner.jobs.set_result(job_id, &result))
                    .await
                {
                    tracing::error!(job_id, error = %err, "failed to store result");
                }
                if let Ok(Some(done)) = inner
                    .with_store_retry("terminal status", || {
                        inner
                            .jobs
                            .update_progress(job_id, JobStatus::Completed, 11, None)
                    })
                    .await
                {
                    inner.bus.publish(ProgressFrame::terminal(&done)).await;
                }
            }
            Err(PipelineError::Cancelled) => {
                let segment = inner
                    .jobs
                    .get(job_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|j| j.current_segment)
                    .unwrap_or(0);
                if let Ok(Some(cancelled)) = inner
                    .with_store_retry("terminal status", || {
                        inner
                            .jobs
                            .update_progress(job_id, JobStatus::Cancelled, segment, None)
                    })
                    .await
                {
                    inner.bus.publish(ProgressFrame::terminal(&cancelled)).await;
                }
            }
            Err(err) => {
                let message = public_failure_message(&err);
                tracing::error!(job_id, error = %err, "job failed");
                let segment = inner
                    .jobs
                    .get(job_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|j| j.current_segment)
                    .unwrap_or(0);
                if let Ok(Some(failed)) = inner
                    .with_store_retry("terminal status", || {
                        inner
                            .jobs
                            .update_progress(job_id, JobStatus::Failed, segment, Some(&message))
                    })
                    .await
                {
                    inner.bus.publish(ProgressFrame::error(&failed, &message)).await;
                }
            }
        }

        inner.remove_flag(job_id).await;
        // Document bytes are owned for the job's lifetime only.
        let _ = inner
            .jobs
            .delete_documents(&[job.doc_id_a.as_str(), job.doc_id_b.as_str()])
            .await;
    }

    /// The 12-segment chain proper.
    async fn execute(
        &self,
        job: &Job,
        flag: &Arc<AtomicBool>,
    ) -> Result<ComparisonResult, PipelineError> {
        let embedder = select_backend(job.options.embedder, remote_config_from_env())?;
        let pipeline = Arc::new(Pipeline::new(
            job.options.clone(),
            embedder,
            Arc::clone(&self.source),
        ));

        let parse_start = Instant::now();
        let (artifacts_a, parsed_a) = self
            .preprocess_document(job, &pipeline, &job.doc_id_a, "A", 1, flag)
            .await?;
        let parse_a = elapsed_ms(parse_start);

        let parse_start = Instant::now();
        let (artifacts_b, parsed_b) = self
            .preprocess_document(job, &pipeline, &job.doc_id_b, "B", 5, flag)
            .await?;
        let parse_b = elapsed_ms(parse_start);

        if !parsed_a && !parsed_b {
            return Err(PipelineError::Parse(
                "neither document has an extractable text layer".into(),
            ));
        }

        let artifacts_a = Arc::new(artifacts_a);
        let artifacts_b = Arc::new(artifacts_b);

        // Segment 9: alignment.
        let align_start = Instant::now();
        let outcome = {
            let pipeline = Arc::clone(&pipeline);
            let a = Arc::clone(&artifacts_a);
            let b = Arc::clone(&artifacts_b);
            self.run_segment(&job.job_id, 9, flag, move || {
                Ok(pipeline.alignment_stage(&a.clauses, &b.clauses))
            })
            .await?
        };
        self.put_artifact(SegmentStore::job_key(&job.job_id, 9), &outcome.matches)
            .await?;
        let align = elapsed_ms(align_start);

        // Segment 10: delta interpretation.
        let diff_start = Instant::now();
        let clauses_a = Arc::new(artifacts_a.clause_map());
        let clauses_b = Arc::new(artifacts_b.clause_map());
        let matches = {
            let pipeline = Arc::clone(&pipeline);
            let initial = Arc::new(outcome.matches);
            let clauses_a = Arc::clone(&clauses_a);
            let clauses_b = Arc::clone(&clauses_b);
            self.run_segment(&job.job_id, 10, flag, move || {
                let mut matches = (*initial).clone();
                pipeline.delta_stage(&mut matches, &clauses_a, &clauses_b);
                sort_matches(&mut matches);
                Ok(matches)
            })
            .await?
        };
        self.put_artifact(SegmentStore::job_key(&job.job_id, 10), &matches)
            .await?;

        // Segment 11: summary and assembly.
        let summary = {
            let pipeline = Arc::clone(&pipeline);
            let matches = matches.clone();
            let clauses_a = Arc::clone(&clauses_a);
            let clauses_b = Arc::clone(&clauses_b);
            self.run_segment(&job.job_id, 11, flag, move || {
                Ok(pipeline.summary_stage(&matches, &clauses_a, &clauses_b))
            })
            .await?
        };
        let diff = elapsed_ms(diff_start);

        let mut warnings = Vec::new();
        warnings.extend(artifacts_a.warnings.iter().cloned());
        warnings.extend(artifacts_b.warnings.iter().cloned());
        warnings.extend(outcome.warnings);

        let result = ComparisonResult {
            summary,
            matches,
            unmapped_a: artifacts_a.admin_block_ids(),
            unmapped_b: artifacts_b.admin_block_ids(),
            warnings,
            timings_ms: Timings {
                parse_a,
                parse_b,
                align,
                diff,
                total: parse_a + parse_b + align + diff,
            },
        };
        self.put_artifact(SegmentStore::job_key(&job.job_id, 11), &result)
            .await?;
        Ok(result)
    }

    /// Segments 1-4 (A) or 5-8 (B) for one document.
    ///
    /// A missing text layer downgrades to empty artifacts plus a warning;
    /// the remaining segments still run so progress stays monotonic.
    async fn preprocess_document(
        &self,
        job: &Job,
        pipeline: &Arc<Pipeline>,
        doc_id: &str,
        label: &str,
        base_segment: u32,
        flag: &Arc<AtomicBool>,
    ) -> Result<(DocumentArtifacts, bool), PipelineError> {
        let bytes = self
            .with_store_retry("document bytes", || self.jobs.load_document(doc_id))
            .await?
            .ok_or_else(|| PipelineError::Internal(format!("missing bytes for {doc_id}")))?;
        let bytes = Arc::new(bytes);

        let layout = {
            let pipeline = Arc::clone(pipeline);
            let bytes = Arc::clone(&bytes);
            self.run_segment(&job.job_id, base_segment, flag, move || {
                pipeline.layout_stage(&bytes)
            })
            .await
        };
        let (mut blocks, mut warnings, parsed) = match layout {
            Ok((_, blocks)) => (blocks, Vec::new(), true),
            Err(PipelineError::Parse(message)) => {
                tracing::warn!(job_id = %job.job_id, label, %message, "document did not parse");
                (
                    Vec::new(),
                    vec![format!("document {label} failed to parse: {message}")],
                    false,
                )
            }
            Err(err) => return Err(err),
        };
        self.put_artifact(SegmentStore::doc_key(doc_id, 1), &blocks)
            .await?;

        let definitions = {
            let pipeline = Arc::clone(pipeline);
            let blocks = blocks.clone();
            self.run_segment(&job.job_id, base_segment + 1, flag, move || {
                Ok(pipeline.definitions_stage(&blocks))
            })
            .await?
        };
        self.put_artifact(SegmentStore::doc_key(doc_id, 2), &definitions)
            .await?;

        let clause_types = {
            let pipeline = Arc::clone(pipeline);
            let scratch = blocks.clone();
            self.run_segment(&job.job_id, base_segment + 2, flag, move || {
                let mut blocks = scratch.clone();
                let types = pipeline.classification_stage(&mut blocks);
                Ok((blocks, types))
            })
            .await
            .map(|(classified, types)| {
                blocks = classified;
                types
            })?
        };
        self.put_artifact(SegmentStore::doc_key(doc_id, 3), &blocks)
            .await?;

        let clauses = {
            let pipeline = Arc::clone(pipeline);
            let blocks = blocks.clone();
            let types = clause_types.clone();
            let definitions = definitions.clone();
            self.run_segment(&job.job_id, base_segment + 3, flag, move || {
                Ok(pipeline.dna_stage(&blocks, &types, &definitions))
            })
            .await?
        };
        self.put_artifact(SegmentStore::doc_key(doc_id, 4), &clauses)
            .await?;

        if parsed && clauses.is_empty() {
            warnings.push(crate::pipeline::EMPTY_DOCUMENT_WARNING.to_string());
        }

        Ok((
            DocumentArtifacts {
                doc_id: doc_id.to_string(),
                blocks,
                definitions,
                clause_types,
                clauses,
                warnings,
            },
            parsed,
        ))
    }

    /// Runs one segment body with progress emission, cancellation checks at
    /// the boundary, a soft deadline, and retry for transient failures.
    async fn run_segment<T, F>(
        &self,
        job_id: &str,
        segment: u32,
        flag: &Arc<AtomicBool>,
        body: F,
    ) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, PipelineError> + Clone + Send + 'static,
    {
        if flag.load(Ordering::Acquire) {
            return Err(PipelineError::Cancelled);
        }
        self.emit(job_id, JobStatus::Running, segment, None).await?;

        let mut attempt = 0u32;
        loop {
            let body = body.clone();
            let outcome = timeout(
                self.config.segment_soft_timeout,
                tokio::task::spawn_blocking(body),
            )
            .await;
            match outcome {
                Err(_) => {
                    return Err(PipelineError::Timeout(format!(
                        "segment {segment} exceeded its soft timeout"
                    )))
                }
                Ok(Err(join_err)) => {
                    return Err(PipelineError::Internal(format!(
                        "segment task failed: {join_err}"
                    )))
                }
                Ok(Ok(Ok(value))) => {
                    // In-flight work finished; discard it on observed cancel.
                    if flag.load(Ordering::Acquire) {
                        return Err(PipelineError::Cancelled);
                    }
                    return Ok(value);
                }
                Ok(Ok(Err(err))) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(job_id, segment, attempt, error = %err, "retrying segment");
                    self.emit(job_id, JobStatus::Retrying, segment, Some(&err.to_string()))
                        .await?;
                    sleep(self.backoff(attempt)).await;
                    if flag.load(Ordering::Acquire) {
                        return Err(PipelineError::Cancelled);
                    }
                    self.emit(job_id, JobStatus::Running, segment, None).await?;
                }
                Ok(Ok(Err(err))) => return Err(err),
            }
        }
    }

    async fn emit(
        &self,
        job_id: &str,
        status: JobStatus,
        segment: u32,
        error_message: Option<&str>,
    ) -> Result<(), PipelineError> {
        let updated = self
            .with_store_retry("job progress", || {
                self.jobs
                    .update_progress(job_id, status, segment, error_message)
            })
            .await?;
        if let Some(job) = updated {
            let frame = match status {
                JobStatus::Retrying => {
                    ProgressFrame::error(&job, error_message.unwrap_or("retrying"))
                }
                _ => ProgressFrame::progress(&job),
            };
            self.bus.publish(frame).await;
        }
        Ok(())
    }

    /// Exponential backoff with uniform jitter in `[0, 50%]`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .retry_base
            .saturating_mul(1u32 << (attempt - 1).min(8));
        let capped = exp.min(self.config.retry_cap);
        let jitter = rand::thread_rng().gen_range(0.0..0.5);
        capped.mul_f64(1.0 + jitter)
    }
}

/// Failure text exposed to callers; internals stay in the server log.
fn public_failure_message(err: &PipelineError) -> String {
    match err {
        PipelineError::Internal(_) => "internal_error".to_string(),
        PipelineError::Timeout(_) => "timeout".to_string(),
        PipelineError::StorageTransient(_) => "storage".to_string(),
        other => other.to_string(),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PlainTextSource;
    use crate::options::EmbedderChoice;
    use crate::progress::FrameType;

    /// Page source that slows layout down so cancellation can land mid-job.
    struct SlowSource {
        delay: Duration,
    }

    impl PageSource for SlowSource {
        fn pages(&self, bytes: &[u8]) -> Result<Vec<String>, PipelineError> {
            std::thread::sleep(self.delay);
            PlainTextSource.pages(bytes)
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            workers: 1,
            max_retries: 1,
            retry_base: Duration::from_millis(5),
            retry_cap: Duration::from_millis(10),
            segment_soft_timeout: Duration::from_secs(5),
            job_hard_timeout: Duration::from_secs(10),
            job_ttl: Duration::from_secs(60),
        }
    }

    fn orchestrator(source: Arc<dyn PageSource>) -> Orchestrator {
        Orchestrator::new(
            test_config(),
            JobStore::open_in_memory().unwrap(),
            SegmentStore::open_in_memory().unwrap(),
            ProgressBus::new(),
            source,
        )
    }

    fn options() -> CompareOptions {
        CompareOptions {
            embedder: EmbedderChoice::Local,
            ..CompareOptions::default()
        }
    }

    async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> Job {
        for _ in 0..200 {
            let job = orchestrator.jobs().get(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn job_runs_to_completion_with_result() {
        let orchestrator = orchestrator(Arc::new(PlainTextSource));
        let a = "We will pay for theft of contents.\n\nWe will not pay for flood damage.";
        let b = "We will pay for theft of contents.\n\nTerrorism is excluded.";
        let job = orchestrator
            .submit(
                a.as_bytes().to_vec(),
                Some("a.txt".into()),
                b.as_bytes().to_vec(),
                Some("b.txt".into()),
                options(),
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let done = wait_terminal(&orchestrator, &job.job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.current_segment, 11);
        assert_eq!(done.progress_pct, 100.0);

        let result = orchestrator
            .jobs()
            .get_result(&job.job_id)
            .await
            .unwrap()
            .expect("stored result");
        let counts = result.summary.counts;
        assert_eq!(
            counts.added + counts.removed + counts.modified + counts.unchanged,
            result.matches.len()
        );

        // Document bytes are purged on the terminal transition.
        assert!(orchestrator
            .jobs()
            .load_document(&job.doc_id_a)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_frames_are_monotonic_to_terminal() {
        // Slow layout keeps the job alive until the subscription lands.
        let orchestrator = orchestrator(Arc::new(SlowSource {
            delay: Duration::from_millis(25),
        }));
        let text = "We will pay for theft of contents.";
        let job = orchestrator
            .submit(
                text.as_bytes().to_vec(),
                None,
                text.as_bytes().to_vec(),
                None,
                options(),
            )
            .await
            .unwrap();

        let mut rx = orchestrator.bus().subscribe(&job.job_id).await;
        let mut last_segment = 0u32;
        let mut saw_terminal = false;
        while let Ok(frame) = rx.recv().await {
            if let Some(segment) = frame.segment {
                assert!(segment >= last_segment, "segment went backwards");
                last_segment = segment;
            }
            if frame.is_terminal() {
                assert_eq!(frame.frame_type, FrameType::Final);
                saw_terminal = true;
                break;
            }
        }
        assert!(saw_terminal);
        assert_eq!(last_segment, 11);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_lands_within_a_segment_boundary() {
        let orchestrator = orchestrator(Arc::new(SlowSource {
            delay: Duration::from_millis(40),
        }));
        let text = "We will pay for theft of contents.";
        let job = orchestrator
            .submit(
                text.as_bytes().to_vec(),
                None,
                text.as_bytes().to_vec(),
                None,
                options(),
            )
            .await
            .unwrap();

        let mut rx = orchestrator.bus().subscribe(&job.job_id).await;
        // Let at least one working segment start before cancelling.
        let mut seen = 0;
        while let Ok(frame) = rx.recv().await {
            if frame.segment.unwrap_or(0) >= 1 {
                seen += 1;
            }
            if seen >= 1 {
                break;
            }
        }
        let (cancelled, _message) = orchestrator.cancel(&job.job_id).await.unwrap();
        assert!(cancelled);

        let done = wait_terminal(&orchestrator, &job.job_id).await;
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(orchestrator
            .jobs()
            .get_result(&job.job_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_a_queued_job_is_immediate() {
        // Zero workers are clamped to one, so stall it with a slow job first.
        let orchestrator = orchestrator(Arc::new(SlowSource {
            delay: Duration::from_millis(100),
        }));
        let text = "We will pay for theft.";
        let first = orchestrator
            .submit(
                text.as_bytes().to_vec(),
                None,
                text.as_bytes().to_vec(),
                None,
                options(),
            )
            .await
            .unwrap();
        let second = orchestrator
            .submit(
                text.as_bytes().to_vec(),
                None,
                text.as_bytes().to_vec(),
                None,
                options(),
            )
            .await
            .unwrap();

        let (cancelled, message) = orchestrator.cancel(&second.job_id).await.unwrap();
        assert!(cancelled);
        assert_eq!(message, "job cancelled before execution");
        let job = orchestrator.jobs().get(&second.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // The stalled first job still completes.
        let done = wait_terminal(&orchestrator, &first.job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_a_terminal_job_reports_false() {
        let orchestrator = orchestrator(Arc::new(PlainTextSource));
        let text = "We will pay for theft.";
        let job = orchestrator
            .submit(
                text.as_bytes().to_vec(),
                None,
                text.as_bytes().to_vec(),
                None,
                options(),
            )
            .await
            .unwrap();
        wait_terminal(&orchestrator, &job.job_id).await;
        let (cancelled, message) = orchestrator.cancel(&job.job_id).await.unwrap();
        assert!(!cancelled);
        assert_eq!(message, "job already COMPLETED");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unparseable_pair_fails_with_parse_reason() {
        let orchestrator = orchestrator(Arc::new(PlainTextSource));
        let bad = vec![0xffu8, 0xfe, 0x00];
        let job = orchestrator
            .submit(bad.clone(), None, bad, None, options())
            .await
            .unwrap();
        let done = wait_terminal(&orchestrator, &job.job_id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error_message.unwrap().contains("parse"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_bad_document_still_completes_with_warning() {
        let orchestrator = orchestrator(Arc::new(PlainTextSource));
        let good = "We will pay for theft of contents.";
        let bad = vec![0xffu8, 0xfe, 0x00];
        let job = orchestrator
            .submit(good.as_bytes().to_vec(), None, bad, None, options())
            .await
            .unwrap();
        let done = wait_terminal(&orchestrator, &job.job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        let result = orchestrator
            .jobs()
            .get_result(&job.job_id)
            .await
            .unwrap()
            .unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("failed to parse")));
    }
}
