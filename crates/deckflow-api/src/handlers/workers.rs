//! Worker-facing endpoints: registration, heartbeats, leasing, progress, and
//! completion. Every task mutation requires the caller to hold the lease;
//! mismatches answer 409 with code `lease_lost` so the worker aborts.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;

use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use deckflow_core::models::{
    ClaimRequest, CompleteRequest, HeartbeatRequest, RegisterWorkerRequest, ReleaseRequest,
    ReportProgressRequest, TaskOutcome, TaskResponse, WorkerResponse,
};

/// Idempotent worker registration.
#[tracing::instrument(skip(state, req), fields(worker_id = %req.worker_id))]
pub async fn register_worker(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<RegisterWorkerRequest>,
) -> Result<Json<WorkerResponse>, HttpAppError> {
    let worker = state.workers.register(&req).await?;
    Ok(Json(WorkerResponse::from(worker)))
}

/// Liveness refresh. Creates the worker record on first contact.
#[tracing::instrument(skip(state, req))]
pub async fn worker_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    ValidatedJson(req): ValidatedJson<HeartbeatRequest>,
) -> Result<Json<WorkerResponse>, HttpAppError> {
    let worker = state.workers.heartbeat(&worker_id, req.current_load).await?;
    Ok(Json(WorkerResponse::from(worker)))
}

/// List registered workers.
#[tracing::instrument(skip(state))]
pub async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    let workers = state.workers.list_workers().await?;
    let workers: Vec<WorkerResponse> = workers.into_iter().map(WorkerResponse::from).collect();
    Ok(Json(serde_json::json!({
        "workers": workers,
        "count": workers.len()
    })))
}

/// Claim the next runnable task. Answers 204 when nothing is runnable for
/// the offered capabilities.
#[tracing::instrument(skip(state, req))]
pub async fn claim_task(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    ValidatedJson(req): ValidatedJson<ClaimRequest>,
) -> Result<Response, HttpAppError> {
    let task = state
        .tasks
        .claim_next(
            &worker_id,
            &req.capabilities,
            state.config.queue.lease_duration_secs,
        )
        .await?;

    match task {
        Some(task) => Ok(Json(TaskResponse::from(task)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Record progress. Doubles as a lease renewal; callers are expected to
/// report at least once every half lease duration.
#[tracing::instrument(skip(state, req))]
pub async fn report_progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    ValidatedJson(req): ValidatedJson<ReportProgressRequest>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    let task = state
        .tasks
        .report_progress(
            task_id,
            &req.worker_id,
            req.progress,
            req.step_name.as_deref(),
            req.message.as_deref(),
            req.step_data,
            state.config.queue.lease_duration_secs,
        )
        .await?;
    Ok(Json(TaskResponse::from(task)))
}

/// Report the outcome of a claimed task.
#[tracing::instrument(skip(state, req))]
pub async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    ValidatedJson(req): ValidatedJson<CompleteRequest>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    let queue = &state.config.queue;
    let task = match req.outcome {
        TaskOutcome::Success {
            result_path,
            metadata,
        } => {
            state
                .tasks
                .complete_success(task_id, &req.worker_id, &result_path, metadata)
                .await?
        }
        TaskOutcome::Failure { error } => {
            state
                .tasks
                .complete_failure(
                    task_id,
                    &req.worker_id,
                    &error,
                    queue.retry_base_backoff_secs,
                    queue.retry_max_backoff_secs,
                )
                .await?
        }
    };
    Ok(Json(TaskResponse::from(task)))
}

/// Return a claimed task to the queue without consuming retry budget.
#[tracing::instrument(skip(state, req))]
pub async fn release_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    ValidatedJson(req): ValidatedJson<ReleaseRequest>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    let task = state.tasks.release(task_id, &req.worker_id).await?;
    Ok(Json(TaskResponse::from(task)))
}
