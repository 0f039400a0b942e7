//! Dispatcher-side task endpoints: enqueue, inspect, cancel.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use std::sync::Arc;

use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use deckflow_core::models::{
    CreateTaskRequest, ProgressEventResponse, TaskListQuery, TaskResponse, TaskStats,
};
use deckflow_core::AppError;

/// Enqueue a new task.
#[tracing::instrument(skip(state, req))]
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), HttpAppError> {
    let task = state.dispatch.enqueue(req).await?;
    Ok((StatusCode::CREATED, Json(TaskResponse::from(task))))
}

/// Get a task by ID
#[tracing::instrument(skip(state))]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    let task = state.tasks.get_task(task_id).await?;
    match task {
        Some(task) => Ok(Json(TaskResponse::from(task))),
        None => Err(AppError::NotFound(format!("Task {} not found", task_id)).into()),
    }
}

/// List tasks with optional filters
#[tracing::instrument(skip(state))]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    let tasks = state.tasks.list_tasks(query).await?;
    let task_responses: Vec<TaskResponse> = tasks.into_iter().map(TaskResponse::from).collect();

    Ok(Json(serde_json::json!({
        "tasks": task_responses,
        "count": task_responses.len()
    })))
}

/// Aggregated task statistics
#[tracing::instrument(skip(state))]
pub async fn get_task_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TaskStats>, HttpAppError> {
    let stats = state.tasks.get_stats().await?;
    Ok(Json(stats))
}

/// Idempotent cancel. An in-flight worker observes the lost lease on its
/// next call and aborts.
#[tracing::instrument(skip(state))]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    let task = state.tasks.cancel_task(task_id).await?;
    Ok(Json(TaskResponse::from(task)))
}

/// The append-only progress log for a task.
#[tracing::instrument(skip(state))]
pub async fn get_task_progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    let events = state.tasks.list_progress(task_id).await?;
    let events: Vec<ProgressEventResponse> =
        events.into_iter().map(ProgressEventResponse::from).collect();

    Ok(Json(serde_json::json!({
        "events": events,
        "count": events.len()
    })))
}
