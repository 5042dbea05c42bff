//! Job coordinator HTTP API.
//!
//! Stateless front end over a [`Broker`]: validates submissions, enqueues
//! them, and reports state, cancellation and queue statistics. Every
//! response, including errors, panics and unknown routes, is JSON.

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::Broker;
use crate::config::ApiConfig;
use crate::error::ServiceError;
use crate::executor::panic_message;
use crate::job::{
    ConversionResult, JobDescriptor, JobId, JobState, ProgressInfo, QueueStats, TaskInfo,
    TaskRecord,
};

pub const SERVICE_NAME: &str = "dwg-converter";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    /// Maximum request body in bytes.
    pub max_payload: usize,
}

impl AppState {
    pub fn new(broker: Arc<dyn Broker>, max_payload: usize) -> Self {
        Self {
            broker,
            max_payload,
        }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    let max_payload = state.max_payload;

    Router::new()
        .route("/health", only(get(health)))
        .route("/convert", only(post(submit)))
        .route("/status/{task_id}", only(get(status)))
        .route("/cancel/{task_id}", only(post(cancel)))
        .route("/queue/stats", only(get(queue_stats)))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_payload))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Serves the API on the configured address until `shutdown` fires.
pub async fn serve(config: &ApiConfig, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server failed")?;

    info!("API server stopped");
    Ok(())
}

fn only(route: MethodRouter<AppState>) -> MethodRouter<AppState> {
    route.fallback(method_not_allowed)
}

async fn not_found() -> Response {
    ServiceError::NotFound("Not found".to_string()).into_response()
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "success": false, "error": "Method not allowed" })),
    )
        .into_response()
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    ServiceError::Internal(format!("Internal error: {}", panic_message(payload))).into_response()
}

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    input_path: Option<String>,
    output_path: Option<String>,
    #[serde(default)]
    priority: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub task_id: JobId,
    pub message: String,
}

/// POST /convert
async fn submit(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ServiceError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServiceError::payload_too_large(state.max_payload)
        } else {
            ServiceError::Validation(rejection.body_text())
        }
    })?;

    let descriptor = parse_submission(&body)?;

    if tokio::fs::metadata(&descriptor.input_path).await.is_err() {
        return Err(ServiceError::NotFound(format!(
            "Input file not found: {}",
            descriptor.input_path
        )));
    }

    let input_path = descriptor.input_path.clone();
    let output_path = descriptor.output_path.clone();
    let task_id = state.broker.enqueue(descriptor).await?;

    info!(
        "Submitted conversion task {}: {} -> {}",
        task_id, input_path, output_path
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            success: true,
            task_id,
            message: "Conversion job submitted successfully".to_string(),
        }),
    ))
}

fn parse_submission(body: &[u8]) -> Result<JobDescriptor, ServiceError> {
    let no_data = || ServiceError::Validation("No JSON data provided".to_string());

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(no_data());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ServiceError::Validation(format!("Invalid JSON body: {e}")))?;
    match &value {
        Value::Null => return Err(no_data()),
        Value::Object(map) if map.is_empty() => return Err(no_data()),
        _ => {}
    }

    let request: SubmitRequest = serde_json::from_value(value)
        .map_err(|e| ServiceError::Validation(format!("Invalid request body: {e}")))?;

    match (request.input_path, request.output_path) {
        (Some(input), Some(output)) if !input.is_empty() && !output.is_empty() => {
            Ok(JobDescriptor::new(input, output, request.priority))
        }
        _ => Err(ServiceError::Validation(
            "Missing required fields: input_path, output_path".to_string(),
        )),
    }
}

/// Client-facing view of a job's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub task_id: JobId,
    pub state: JobState,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ConversionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    pub fn from_record(task_id: JobId, record: TaskRecord) -> Self {
        let mut response = Self {
            task_id,
            state: record.state.clone(),
            status: String::new(),
            meta: None,
            result: None,
            error: None,
        };

        match record.state {
            JobState::Pending => {
                response.status = "Task is waiting in queue".to_string();
            }
            JobState::Processing => {
                response.status = "Task is being processed".to_string();
                response.meta = record.progress().map(progress_meta);
            }
            JobState::Success => {
                response.status = "Task completed successfully".to_string();
                response.result = record.result().cloned();
            }
            JobState::Failure => {
                response.status = "Task failed".to_string();
                match record.info {
                    Some(TaskInfo::Error(failure)) => {
                        response.result = Some(failure.to_result());
                        response.error = Some(failure.message);
                    }
                    Some(TaskInfo::Result(result)) => {
                        response.error = result.error.clone();
                        response.result = Some(result);
                    }
                    _ => response.error = Some("Task failed".to_string()),
                }
            }
            JobState::Revoked => {
                response.status = "Task was cancelled".to_string();
                response.meta = record.info.as_ref().map(info_meta);
            }
            JobState::Other(ref name) => {
                response.status = name.clone();
                response.meta = record.info.as_ref().map(info_meta);
            }
        }
        response
    }
}

fn progress_meta(progress: &ProgressInfo) -> Value {
    json!({ "status": progress.status, "progress": progress.progress })
}

fn info_meta(info: &TaskInfo) -> Value {
    match info {
        TaskInfo::Progress(progress) => progress_meta(progress),
        TaskInfo::Result(result) => json!(result),
        TaskInfo::Error(failure) => json!(failure),
    }
}

/// GET /status/{task_id}
async fn status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<StatusResponse>, ServiceError> {
    let task_id = JobId::from(task_id);
    let record = state.broker.fetch_state(&task_id).await?;
    Ok(Json(StatusResponse::from_record(task_id, record)))
}

/// POST /cancel/{task_id}
async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    let task_id = JobId::from(task_id);
    state.broker.revoke(&task_id).await?;
    info!("Cancelled task {}", task_id);
    Ok(Json(json!({
        "success": true,
        "message": "Task cancelled successfully",
    })))
}

/// GET /queue/stats
async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ServiceError> {
    let snapshots = state.broker.inspect_workers().await?;
    Ok(Json(QueueStats::aggregate(&snapshots)))
}
