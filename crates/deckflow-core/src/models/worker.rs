use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "worker_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Cpu,
    Gpu,
}

impl Display for WorkerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            WorkerKind::Cpu => write!(f, "cpu"),
            WorkerKind::Gpu => write!(f, "gpu"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "worker_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Inactive,
    Maintenance,
}

/// An active process able to execute tasks. Created on first
/// register/heartbeat; marked inactive when heartbeats stop; pruned after a
/// retention window. Worker liveness never touches task leases.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Worker {
    pub id: String,
    pub kind: WorkerKind,
    pub capabilities: Vec<String>,
    pub max_concurrent: i32,
    pub current_load: i32,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    pub kind: WorkerKind,
    pub capabilities: Vec<String>,
    pub max_concurrent: i32,
    pub current_load: i32,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl From<Worker> for WorkerResponse {
    fn from(worker: Worker) -> Self {
        Self {
            id: worker.id,
            kind: worker.kind,
            capabilities: worker.capabilities,
            max_concurrent: worker.max_concurrent,
            current_load: worker.current_load,
            status: worker.status,
            last_heartbeat: worker.last_heartbeat,
        }
    }
}

/// Body of `POST /workers/register`. Idempotent.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    pub kind: WorkerKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_concurrent: i32,
}

/// Body of `POST /workers/{id}/heartbeat`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub current_load: i32,
}

/// Body of `POST /workers/{id}/claim`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Body of `POST /tasks/{id}/progress` (worker-facing).
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportProgressRequest {
    pub worker_id: String,
    pub progress: i32,
    pub step_name: Option<String>,
    pub message: Option<String>,
    pub step_data: Option<serde_json::Value>,
}

/// Outcome reported by a worker in `POST /tasks/{id}/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        result_path: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    Failure {
        error: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub worker_id: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// Body of `POST /tasks/{id}/release`: returns the task to the queue without
/// consuming retry budget.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub worker_id: String,
}
