use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "step_status", rename_all = "lowercase")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

/// Append-only per-step progress record. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProgressEvent {
    pub id: i64,
    pub task_id: i64,
    pub step_name: String,
    pub step_status: StepStatus,
    pub progress: i32,
    pub message: Option<String>,
    pub step_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressEventResponse {
    pub id: i64,
    pub step_name: String,
    pub step_status: StepStatus,
    pub progress: i32,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ProgressEvent> for ProgressEventResponse {
    fn from(event: ProgressEvent) -> Self {
        Self {
            id: event.id,
            step_name: event.step_name,
            step_status: event.step_status,
            progress: event.progress,
            message: event.message,
            created_at: event.created_at,
        }
    }
}
