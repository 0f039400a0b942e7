use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use super::dependency::DependencySpec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    PdfAnalysis,
    VisualAnalysis,
    TemplateProcessing,
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskKind::PdfAnalysis => write!(f, "pdf_analysis"),
            TaskKind::VisualAnalysis => write!(f, "visual_analysis"),
            TaskKind::TemplateProcessing => write!(f, "template_processing"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf_analysis" => Ok(TaskKind::PdfAnalysis),
            "visual_analysis" => Ok(TaskKind::VisualAnalysis),
            "template_processing" => Ok(TaskKind::TemplateProcessing),
            _ => Err(anyhow::anyhow!("Invalid task kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "task_state", rename_all = "lowercase")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Processing,
    Completed,
    Failed,
    Retry,
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Processing => write!(f, "processing"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Retry => write!(f, "retry"),
        }
    }
}

impl TaskState {
    /// Terminal states are never re-leased.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Machine-readable classification of a task's terminal error, stored next
/// to the free-text `last_error`. Dependents killed by an upstream carry
/// `dependency_failed` so callers can tell a cascade from an analyser crash
/// without parsing message text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    AnalysisFailed,
    Cancelled,
    DependencyFailed,
}

impl Display for TaskErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskErrorKind::AnalysisFailed => write!(f, "analysis_failed"),
            TaskErrorKind::Cancelled => write!(f, "cancelled"),
            TaskErrorKind::DependencyFailed => write!(f, "dependency_failed"),
        }
    }
}

/// Scheduling priority. Stored as a plain integer; higher wins.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 3,
    #[default]
    Normal = 5,
    High = 7,
    Critical = 10,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority as i32
    }
}

/// A unit of analysis work. Owned by the queue store; every mutation goes
/// through the task repository so the lease and state invariants hold at each
/// committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    pub deck_id: Option<i64>,
    pub task_kind: TaskKind,
    pub priority: i32,
    pub required_capabilities: Vec<String>,
    pub file_path: String,
    pub company_id: String,
    pub options: serde_json::Value,
    pub state: TaskState,
    pub progress: i32,
    pub current_step: Option<String>,
    pub progress_message: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_code: Option<TaskErrorKind>,
    pub error_count: i32,
    pub result_path: Option<String>,
    pub result_metadata: Option<serde_json::Value>,
    pub completed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether `worker_id` currently holds the lease.
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.state == TaskState::Processing && self.locked_by.as_deref() == Some(worker_id)
    }
}

/// Trait for type-safe task options. The options bag travels as opaque JSON
/// at the system edge; each kind's handler consumes a typed structure.
pub trait TaskOptions: Serialize + for<'de> Deserialize<'de> {
    fn task_kind() -> TaskKind;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfAnalysisOptions {
    pub language: Option<String>,
    pub page_limit: Option<u32>,
}

impl TaskOptions for PdfAnalysisOptions {
    fn task_kind() -> TaskKind {
        TaskKind::PdfAnalysis
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualAnalysisOptions {
    pub vision_model: Option<String>,
    pub detail_level: Option<String>,
    pub page_limit: Option<u32>,
}

impl TaskOptions for VisualAnalysisOptions {
    fn task_kind() -> TaskKind {
        TaskKind::VisualAnalysis
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateProcessingOptions {
    pub template_id: Option<i64>,
    pub vision_model: Option<String>,
}

impl TaskOptions for TemplateProcessingOptions {
    fn task_kind() -> TaskKind {
        TaskKind::TemplateProcessing
    }
}

/// Everything needed to enqueue one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub deck_id: Option<i64>,
    pub task_kind: TaskKind,
    pub priority: i32,
    pub required_capabilities: Vec<String>,
    pub file_path: String,
    pub company_id: String,
    pub options: serde_json::Value,
    pub max_attempts: i32,
    pub dependencies: Vec<DependencySpec>,
}

/// Body of `POST /tasks`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub deck_id: Option<i64>,
    pub task_kind: TaskKind,
    pub file_path: String,
    pub company_id: String,
    pub options: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub required_capabilities: Option<Vec<String>>,
    pub dependencies: Option<Vec<DependencySpec>>,
}

/// Response models for API endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: i64,
    pub deck_id: Option<i64>,
    pub task_kind: TaskKind,
    pub state: TaskState,
    pub priority: i32,
    pub required_capabilities: Vec<String>,
    pub file_path: String,
    pub company_id: String,
    pub options: serde_json::Value,
    pub progress: i32,
    pub current_step: Option<String>,
    pub progress_message: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_code: Option<TaskErrorKind>,
    pub result_path: Option<String>,
    pub result_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            deck_id: task.deck_id,
            task_kind: task.task_kind,
            state: task.state,
            priority: task.priority,
            required_capabilities: task.required_capabilities,
            file_path: task.file_path,
            company_id: task.company_id,
            options: task.options,
            progress: task.progress,
            current_step: task.current_step,
            progress_message: task.progress_message,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            next_retry_at: task.next_retry_at,
            last_error: task.last_error,
            error_code: task.error_code,
            result_path: task.result_path,
            result_metadata: task.result_metadata,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retry: i64,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub state: Option<TaskState>,
    pub task_kind: Option<TaskKind>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Default for TaskListQuery {
    fn default() -> Self {
        Self {
            state: None,
            task_kind: None,
            limit: Some(50),
            offset: Some(0),
        }
    }
}
