//! HTTP admission surface (§6): Job/Job-Run CRUD, pause/resume, log
//! streaming (WS + SSE), log download, and the liveness probe.

use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use futures::stream;
use uuid::Uuid;

use crate::kernel::jobs::{create_job_run, Job, JobRun, TaskConfig, TaskType};
use crate::kernel::AppState;

#[derive(Debug, Deserialize)]
pub struct TaskInput {
    pub name: String,
    #[serde(default)]
    pub task_type: TaskType,
    pub order: i32,
    #[serde(default)]
    pub config: TaskConfig,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
    pub cron_schedule: Option<String>,
    pub tasks: Vec<TaskInput>,
    #[serde(default)]
    pub enqueue_immediately: bool,
}

fn default_source() -> String {
    "api".to_string()
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job: Job,
    pub job_run_id: Option<Uuid>,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let tasks = req
        .tasks
        .into_iter()
        .map(|t| (t.name, t.task_type, t.order, t.config))
        .collect();

    let job = Job::create(
        &state.pool,
        &req.name,
        req.description.as_deref(),
        &req.source,
        req.raw_payload,
        req.cron_schedule.as_deref(),
        tasks,
    )
    .await?;

    let job_run_id = if req.enqueue_immediately {
        let task_ids: Vec<_> = job.tasks.iter().map(|t| t.id).collect();
        let descriptor = create_job_run(&state.pool, job.id, &task_ids, Some("api"), chrono::Utc::now(), json!({}))
            .await?;
        state.queue.enqueue(descriptor.job_run_id).await?;
        JobRun::mark_queued(&state.pool, descriptor.job_run_id).await?;
        Some(descriptor.job_run_id)
    } else {
        None
    };

    Ok(Json(CreateJobResponse { job, job_run_id }))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRunRequest {
    pub job_id: Uuid,
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct CreateJobRunResponse {
    pub job_run_id: Uuid,
    pub task_run_ids: Vec<Uuid>,
}

pub async fn create_job_run_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRunRequest>,
) -> Result<Json<CreateJobRunResponse>, ApiError> {
    let job = Job::find_by_id(&state.pool, req.job_id).await?;
    let task_ids: Vec<_> = job.tasks.iter().map(|t| t.id).collect();

    let descriptor = create_job_run(
        &state.pool,
        req.job_id,
        &task_ids,
        req.triggered_by.as_deref(),
        chrono::Utc::now(),
        req.metadata,
    )
    .await?;

    state.queue.enqueue(descriptor.job_run_id).await?;
    JobRun::mark_queued(&state.pool, descriptor.job_run_id).await?;

    Ok(Json(CreateJobRunResponse {
        job_run_id: descriptor.job_run_id,
        task_run_ids: descriptor.task_run_ids,
    }))
}

pub async fn pause_job_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let paused = JobRun::pause(&state.pool, id).await?;
    Ok(Json(json!({"paused": paused})))
}

pub async fn resume_job_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resumed = JobRun::resume(&state.pool, id).await?;
    if resumed {
        state.queue.enqueue(id).await?;
    }
    Ok(Json(json!({"resumed": resumed})))
}

pub async fn list_paused_job_runs(
    State(state): State<AppState>,
) -> Result<Json<Vec<JobRun>>, ApiError> {
    Ok(Json(JobRun::find_paused(&state.pool).await?))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub job_run_id: Option<Uuid>,
}

fn topic_for(query: &StreamQuery) -> String {
    match query.job_run_id {
        Some(id) => format!("job-run:{id}"),
        None => "global".to_string(),
    }
}

pub async fn logs_stream_sse(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let rx = state.stream_hub.subscribe(&topic_for(&query)).await;

    // A lagged subscriber is dropped rather than resynced: emit one final
    // notice, then end the stream so the client reconnects instead of
    // silently skipping past the gap.
    let stream = stream::unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        match rx.recv().await {
            Ok(value) => Some((
                Ok::<_, Infallible>(Event::default().data(value.to_string())),
                (rx, false),
            )),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => Some((
                Ok(Event::default().event("lagged").data("{}")),
                (rx, true),
            )),
            Err(tokio::sync::broadcast::error::RecvError::Closed) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(30)))
}

pub async fn logs_stream_ws(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let topic = topic_for(&query);
    ws.on_upgrade(move |socket| handle_ws(socket, state, topic))
}

async fn handle_ws(mut socket: WebSocket, state: AppState, topic: String) {
    let mut rx = state.stream_hub.subscribe(&topic).await;
    loop {
        match rx.recv().await {
            Ok(value) => {
                if socket.send(Message::Text(value.to_string())).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                // Dropped rather than resynced: notify, then close so the
                // client reconnects instead of silently skipping the gap.
                let _ = socket.send(Message::Text(r#"{"type":"lagged"}"#.to_string())).await;
                break;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub date: String,
}

pub async fn download_job_run_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> Result<String, ApiError> {
    let path = state.config.log_dir_path().join(format!("{id}-{}.txt", query.date));
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ApiError::NotFound(format!("log file not found: {e}")))
}

pub async fn health() -> &'static str {
    "ok"
}

pub enum ApiError {
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<crate::kernel::jobs::QueueError> for ApiError {
    fn from(e: crate::kernel::jobs::QueueError) -> Self {
        ApiError::Internal(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}
