//! Deck endpoints: the business-level entry into the queue plus read views.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use std::sync::Arc;

use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use deckflow_core::models::{
    AnalyzeDeckRequest, DeckResponse, ScheduleAnalysisResponse, TaskResponse,
};
use deckflow_core::AppError;

/// Schedule the standard analysis chain for a deck.
#[tracing::instrument(skip(state, req))]
pub async fn analyze_deck(
    State(state): State<Arc<AppState>>,
    Path(deck_id): Path<i64>,
    ValidatedJson(req): ValidatedJson<AnalyzeDeckRequest>,
) -> Result<(StatusCode, Json<ScheduleAnalysisResponse>), HttpAppError> {
    let response = state.dispatch.schedule_deck_analysis(deck_id, req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Deck status aggregate: processing state and result location.
#[tracing::instrument(skip(state))]
pub async fn get_deck(
    State(state): State<Arc<AppState>>,
    Path(deck_id): Path<i64>,
) -> Result<Json<DeckResponse>, HttpAppError> {
    let deck = state.decks.get_deck(deck_id).await?;
    match deck {
        Some(deck) => Ok(Json(DeckResponse::from(deck))),
        None => Err(AppError::NotFound(format!("Deck {} not found", deck_id)).into()),
    }
}

/// All tasks for a deck, newest first.
#[tracing::instrument(skip(state))]
pub async fn list_deck_tasks(
    State(state): State<Arc<AppState>>,
    Path(deck_id): Path<i64>,
) -> Result<Json<serde_json::Value>, HttpAppError> {
    if state.decks.get_deck(deck_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Deck {} not found", deck_id)).into());
    }
    let tasks = state.tasks.list_for_deck(deck_id).await?;
    let tasks: Vec<TaskResponse> = tasks.into_iter().map(TaskResponse::from).collect();
    Ok(Json(serde_json::json!({
        "tasks": tasks,
        "count": tasks.len()
    })))
}
