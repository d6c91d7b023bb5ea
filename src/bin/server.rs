use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::timeout;

use clausediff::embedder::{remote_config_from_env, select_backend};
use clausediff::job::JobStatus;
use clausediff::progress::ProgressFrame;
use clausediff::{
    CompareOptions, ComparisonResult, EmbedderChoice, Job, JobStore, Orchestrator,
    OrchestratorConfig, PageSource, PdfPageSource, Pipeline, PipelineError, PlainTextSource,
    SegmentStore,
};

#[derive(Parser, Debug)]
#[command(
    name = "clausediff-server",
    about = "HTTP/WebSocket surface for the clause comparison pipeline"
)]
struct ServerCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "UCC_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// SQLite database path for jobs and segment artifacts.
    #[arg(long, env = "UCC_DB_PATH", default_value = "clausediff.db")]
    db_path: std::path::PathBuf,

    /// Concurrent comparison workers.
    #[arg(long, env = "UCC_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Retry attempts for transient segment failures.
    #[arg(long, env = "UCC_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Seconds a terminal job is retained before purging.
    #[arg(long, env = "UCC_JOB_TTL_SECONDS", default_value_t = 86_400)]
    job_ttl_seconds: u64,

    /// Per-segment soft timeout in seconds.
    #[arg(long, env = "UCC_SEGMENT_SOFT_TIMEOUT", default_value_t = 540)]
    segment_soft_timeout: u64,

    /// Whole-job hard timeout in seconds.
    #[arg(long, env = "UCC_JOB_HARD_TIMEOUT", default_value_t = 600)]
    job_hard_timeout: u64,

    /// Default embedding backend (auto, local or remote).
    #[arg(long, env = "UCC_EMBEDDER", default_value = "auto")]
    embedder: String,

    /// Default similarity threshold.
    #[arg(long, env = "UCC_SIMILARITY_THRESHOLD", default_value_t = 0.72)]
    similarity_threshold: f64,

    /// Accept pre-extracted plain text uploads instead of PDFs (dev mode).
    #[arg(long, env = "UCC_PLAIN_TEXT", default_value_t = false)]
    plain_text: bool,

    /// Maximum upload size in megabytes.
    #[arg(long, default_value_t = 50)]
    max_upload_mb: usize,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
    jobs: JobStore,
    source: Arc<dyn PageSource>,
    default_options: CompareOptions,
    hard_timeout: Duration,
    plain_text: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Serialize)]
struct PreprocessResponse {
    doc_id: String,
    file_name: Option<String>,
    block_count: usize,
    definition_count: usize,
    clause_counts: BTreeMap<String, usize>,
    warnings: Vec<String>,
    blocks: Vec<clausediff::Block>,
}

#[derive(Debug, Serialize)]
struct JobSubmitResponse {
    job_id: String,
    status: &'static str,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct JobCancelResponse {
    job_id: String,
    cancelled: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct JobListResponse {
    jobs: Vec<Job>,
    total: usize,
    limit: usize,
    offset: usize,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

struct Upload {
    bytes: Vec<u8>,
    file_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = ServerCli::parse();
    let embedder_choice: EmbedderChoice = cli
        .embedder
        .parse()
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let default_options = CompareOptions {
        embedder: embedder_choice,
        similarity_threshold: cli.similarity_threshold,
        ..CompareOptions::default()
    };
    default_options
        .validate()
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let jobs = JobStore::open(&cli.db_path).map_err(|err| anyhow::anyhow!("{err}"))?;
    let segments = SegmentStore::open(&cli.db_path).map_err(|err| anyhow::anyhow!("{err}"))?;
    let source: Arc<dyn PageSource> = if cli.plain_text {
        Arc::new(PlainTextSource)
    } else {
        Arc::new(PdfPageSource)
    };

    let config = OrchestratorConfig {
        workers: cli.workers.max(1),
        max_retries: cli.max_retries,
        segment_soft_timeout: Duration::from_secs(cli.segment_soft_timeout.max(1)),
        job_hard_timeout: Duration::from_secs(cli.job_hard_timeout.max(1)),
        job_ttl: Duration::from_secs(cli.job_ttl_seconds.max(1)),
        ..OrchestratorConfig::default()
    };
    let ttl = config.job_ttl;
    let orchestrator = Orchestrator::new(
        config,
        jobs.clone(),
        segments,
        clausediff::ProgressBus::new(),
        Arc::clone(&source),
    );

    spawn_purge_timer(orchestrator.clone(), ttl);

    let state = AppState {
        jobs,
        source,
        default_options,
        hard_timeout: Duration::from_secs(cli.job_hard_timeout.max(1)),
        plain_text: cli.plain_text,
        orchestrator,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ucc/preprocess", post(preprocess_handler))
        .route("/ucc/compare", post(compare_handler))
        .route("/jobs/compare", post(submit_handler))
        .route("/jobs", get(list_handler))
        .route("/jobs/:job_id", get(job_handler))
        .route("/jobs/:job_id/result", get(result_handler))
        .route("/jobs/:job_id/cancel", post(cancel_handler))
        .route("/ws/jobs/:job_id", get(ws_handler))
        .layer(DefaultBodyLimit::max(cli.max_upload_mb.max(1) * 1024 * 1024))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    tracing::info!(%addr, "clausediff-server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server shutdown")?;
    Ok(())
}

/// Periodically drops terminal jobs past their retention window.
fn spawn_purge_timer(orchestrator: Orchestrator, ttl: Duration) {
    let interval = ttl.min(Duration::from_secs(900)).max(Duration::from_secs(5)) / 4;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            match orchestrator.purge_expired().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "purged expired jobs"),
                Err(err) => tracing::warn!(error = %err, "purge sweep failed"),
            }
        }
    });
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn preprocess_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<PreprocessResponse>, ApiError> {
    let (upload, options) = read_single(multipart, &state).await?;
    let pipeline = build_pipeline(&state, &options)?;
    let file_name = upload.file_name.clone();
    let artifacts = tokio::task::spawn_blocking(move || pipeline.preprocess(&upload.bytes))
        .await
        .map_err(|err| internal_error(err.to_string()))?
        .map_err(map_pipeline_error)?;

    let mut clause_counts = BTreeMap::new();
    for clause_type in &artifacts.clause_types {
        *clause_counts
            .entry(clause_type.as_str().to_string())
            .or_insert(0) += 1;
    }
    Ok(Json(PreprocessResponse {
        doc_id: artifacts.doc_id.clone(),
        file_name,
        block_count: artifacts.blocks.len(),
        definition_count: artifacts.definitions.len(),
        clause_counts,
        warnings: artifacts.warnings.clone(),
        blocks: artifacts.blocks,
    }))
}

async fn compare_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ComparisonResult>, ApiError> {
    let (upload_a, upload_b, options) = read_pair(multipart, &state).await?;
    let pipeline = build_pipeline(&state, &options)?;
    let outcome = timeout(
        state.hard_timeout,
        tokio::task::spawn_blocking(move || pipeline.compare(&upload_a.bytes, &upload_b.bytes)),
    )
    .await;
    match outcome {
        Err(_) => Err(gateway_timeout()),
        Ok(Err(join_err)) => Err(internal_error(join_err.to_string())),
        Ok(Ok(Err(err))) => Err(map_pipeline_error(err)),
        Ok(Ok(Ok(result))) => Ok(Json(result)),
    }
}

async fn submit_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<JobSubmitResponse>, ApiError> {
    let (upload_a, upload_b, options) = read_pair(multipart, &state).await?;
    let job = state
        .orchestrator
        .submit(
            upload_a.bytes,
            upload_a.file_name,
            upload_b.bytes,
            upload_b.file_name,
            options,
        )
        .await
        .map_err(map_pipeline_error)?;
    Ok(Json(JobSubmitResponse {
        job_id: job.job_id,
        status: "QUEUED",
        message: "job submitted",
    }))
}

async fn job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    match state.jobs.get(&job_id).await.map_err(map_pipeline_error)? {
        Some(job) => Ok(Json(job)),
        None => Err(not_found("job not found")),
    }
}

async fn result_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(job) = state.jobs.get(&job_id).await.map_err(map_pipeline_error)? else {
        return Err(gone("job not found or purged"));
    };
    match job.status {
        JobStatus::Completed => {
            match state
                .jobs
                .get_result(&job_id)
                .await
                .map_err(map_pipeline_error)?
            {
                Some(result) => Ok(Json(result).into_response()),
                None => Err(gone("result purged")),
            }
        }
        JobStatus::Failed | JobStatus::Cancelled => {
            Ok((StatusCode::CONFLICT, Json(job)).into_response())
        }
        _ => Ok((StatusCode::ACCEPTED, Json(job)).into_response()),
    }
}

async fn cancel_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobCancelResponse>, ApiError> {
    let (cancelled, message) = state
        .orchestrator
        .cancel(&job_id)
        .await
        .map_err(map_pipeline_error)?;
    Ok(Json(JobCancelResponse {
        job_id,
        cancelled,
        message,
    }))
}

async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            JobStatus::parse(&raw.to_uppercase())
                .ok_or_else(|| bad_request(format!("unknown status filter {raw:?}")))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0);
    let (jobs, total) = state
        .jobs
        .list(status, limit, offset)
        .await
        .map_err(map_pipeline_error)?;
    Ok(Json(JobListResponse {
        jobs,
        total,
        limit,
        offset,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| stream_job_progress(socket, job_id, state))
}

/// Streams `initial` then live frames until a terminal frame, then closes
/// with 1000 (normal), 1011 (server error) or 4404 (unknown job).
async fn stream_job_progress(mut socket: WebSocket, job_id: String, state: AppState) {
    // Existence check first, so unknown ids never create a topic.
    if fetch_job_or_close(&mut socket, &state, &job_id).await.is_none() {
        return;
    }

    let mut rx = state.orchestrator.bus().subscribe(&job_id).await;

    // Snapshot AFTER subscribing: a terminal frame published between the
    // existence check and the subscription has already dropped its topic,
    // so only a fresh read of the record can observe that transition.
    let Some(job) = fetch_job_or_close(&mut socket, &state, &job_id).await else {
        return;
    };

    if send_frame(&mut socket, &ProgressFrame::initial(&job)).await.is_err() {
        return;
    }
    if job.status.is_terminal() {
        let frame = if job.status == JobStatus::Failed {
            ProgressFrame::error(&job, job.error_message.as_deref().unwrap_or("failed"))
        } else {
            ProgressFrame::terminal(&job)
        };
        let _ = send_frame(&mut socket, &frame).await;
        let _ = close_with(&mut socket, 1000, "complete").await;
        return;
    }

    loop {
        match rx.recv().await {
            Ok(frame) => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    return;
                }
                if frame.is_terminal() {
                    let _ = close_with(&mut socket, 1000, "complete").await;
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(job_id = %job_id, skipped, "websocket subscriber lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                // Topic dropped; re-read the record for the terminal state.
                match state.jobs.get(&job_id).await {
                    Ok(Some(job)) if job.status.is_terminal() => {
                        let _ = send_frame(&mut socket, &ProgressFrame::terminal(&job)).await;
                        let _ = close_with(&mut socket, 1000, "complete").await;
                    }
                    _ => {
                        let _ = close_with(&mut socket, 1011, "progress stream lost").await;
                    }
                }
                return;
            }
        }
    }
}

/// Reads the job record, closing the socket (4404 or 1011) when it cannot.
async fn fetch_job_or_close(
    socket: &mut WebSocket,
    state: &AppState,
    job_id: &str,
) -> Option<Job> {
    match state.jobs.get(job_id).await {
        Ok(Some(job)) => Some(job),
        Ok(None) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4404,
                    reason: "job not found".into(),
                })))
                .await;
            None
        }
        Err(err) => {
            tracing::error!(error = %err, "job lookup failed for websocket");
            let _ = close_with(socket, 1011, "storage error").await;
            None
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ProgressFrame) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(payload)).await
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) -> Result<(), axum::Error> {
    socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
}

fn build_pipeline(state: &AppState, options: &CompareOptions) -> Result<Pipeline, ApiError> {
    let embedder = select_backend(options.embedder, remote_config_from_env())
        .map_err(map_pipeline_error)?;
    Ok(Pipeline::new(
        options.clone(),
        embedder,
        Arc::clone(&state.source),
    ))
}

async fn read_single(
    mut multipart: Multipart,
    state: &AppState,
) -> Result<(Upload, CompareOptions), ApiError> {
    let mut file = None;
    let mut options = state.default_options.clone();
    while let Some(field) = next_field(&mut multipart).await? {
        match field.0.as_str() {
            "file" => file = Some(field.1),
            "options" => options = parse_options(&field.1)?,
            _ => {}
        }
    }
    let file = file.ok_or_else(|| bad_request("missing multipart field `file`".to_string()))?;
    validate_upload(&file, state)?;
    Ok((file, options))
}

async fn read_pair(
    mut multipart: Multipart,
    state: &AppState,
) -> Result<(Upload, Upload, CompareOptions), ApiError> {
    let mut file_a = None;
    let mut file_b = None;
    let mut options = state.default_options.clone();
    while let Some(field) = next_field(&mut multipart).await? {
        match field.0.as_str() {
            "file_a" => file_a = Some(field.1),
            "file_b" => file_b = Some(field.1),
            "options" => options = parse_options(&field.1)?,
            _ => {}
        }
    }
    let file_a =
        file_a.ok_or_else(|| bad_request("missing multipart field `file_a`".to_string()))?;
    let file_b =
        file_b.ok_or_else(|| bad_request("missing multipart field `file_b`".to_string()))?;
    validate_upload(&file_a, state)?;
    validate_upload(&file_b, state)?;
    Ok((file_a, file_b, options))
}

async fn next_field(multipart: &mut Multipart) -> Result<Option<(String, Upload)>, ApiError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(format!("malformed multipart body: {err}")))?;
    let Some(field) = field else {
        return Ok(None);
    };
    let name = field.name().unwrap_or_default().to_string();
    let file_name = field.file_name().map(str::to_string);
    let bytes = field
        .bytes()
        .await
        .map_err(|err| bad_request(format!("failed to read field {name}: {err}")))?;
    Ok(Some((
        name,
        Upload {
            bytes: bytes.to_vec(),
            file_name,
        },
    )))
}

fn parse_options(upload: &Upload) -> Result<CompareOptions, ApiError> {
    let raw = std::str::from_utf8(&upload.bytes)
        .map_err(|_| bad_request("options field is not UTF-8".to_string()))?;
    CompareOptions::from_json(raw).map_err(map_pipeline_error)
}

fn validate_upload(upload: &Upload, state: &AppState) -> Result<(), ApiError> {
    if upload.bytes.is_empty() {
        return Err(bad_request("uploaded file is empty".to_string()));
    }
    if !state.plain_text && !upload.bytes.starts_with(b"%PDF") {
        return Err(bad_request("uploaded file is not a PDF".to_string()));
    }
    Ok(())
}

fn map_pipeline_error(err: PipelineError) -> ApiError {
    match err {
        PipelineError::InvalidInput(message) => bad_request(message),
        PipelineError::Parse(message) => bad_request(message),
        PipelineError::Timeout(_) => gateway_timeout(),
        PipelineError::Internal(message) => {
            tracing::error!(%message, "internal pipeline failure");
            internal_error("internal_error".to_string())
        }
        other => internal_error(other.to_string()),
    }
}

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { message }))
}

fn not_found(message: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            message: message.to_string(),
        }),
    )
}

fn gone(message: &str) -> ApiError {
    (
        StatusCode::GONE,
        Json(ErrorBody {
            message: message.to_string(),
        }),
    )
}

fn gateway_timeout() -> ApiError {
    (
        StatusCode::GATEWAY_TIMEOUT,
        Json(ErrorBody {
            message: "comparison timed out".to_string(),
        }),
    )
}

fn internal_error(message: String) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { message }))
}
