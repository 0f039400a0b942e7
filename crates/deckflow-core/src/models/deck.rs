use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "deck_status", rename_all = "lowercase")]
#[serde(rename_all = "snake_case")]
pub enum DeckStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Minimal projection of the user-facing pitch deck. The queue touches only
/// the processing fields: `processing_status` and `results_file_path` are
/// written exclusively by the completion handler,
/// `current_processing_task_id` exclusively by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Deck {
    pub id: i64,
    pub company_id: String,
    pub file_path: String,
    pub processing_status: DeckStatus,
    pub results_file_path: Option<String>,
    pub current_processing_task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeckResponse {
    pub id: i64,
    pub company_id: String,
    pub file_path: String,
    pub processing_status: DeckStatus,
    pub results_file_path: Option<String>,
    pub current_processing_task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<Deck> for DeckResponse {
    fn from(deck: Deck) -> Self {
        Self {
            id: deck.id,
            company_id: deck.company_id,
            file_path: deck.file_path,
            processing_status: deck.processing_status,
            results_file_path: deck.results_file_path,
            current_processing_task_id: deck.current_processing_task_id,
            created_at: deck.created_at,
        }
    }
}

/// Body of `POST /decks/{id}/analyze`.
#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeDeckRequest {
    pub options: Option<serde_json::Value>,
    pub priority: Option<i32>,
}

/// Result of scheduling an analysis chain: the ids in chain order, head
/// first. The deck's `current_processing_task_id` points at the head.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleAnalysisResponse {
    pub deck_id: i64,
    pub task_ids: Vec<i64>,
    pub head_task_id: i64,
}
