pub mod deck;
pub mod dependency;
pub mod progress;
pub mod task;
pub mod worker;

pub use deck::{AnalyzeDeckRequest, Deck, DeckResponse, DeckStatus, ScheduleAnalysisResponse};
pub use dependency::{DependencyMode, DependencySpec};
pub use progress::{ProgressEvent, ProgressEventResponse, StepStatus};
pub use task::{
    CreateTaskRequest, PdfAnalysisOptions, Priority, Task, TaskErrorKind, TaskKind, TaskListQuery,
    TaskOptions, TaskResponse, TaskSpec, TaskState, TaskStats, TemplateProcessingOptions,
    VisualAnalysisOptions,
};
pub use worker::{
    ClaimRequest, CompleteRequest, HeartbeatRequest, RegisterWorkerRequest, ReleaseRequest,
    ReportProgressRequest, TaskOutcome, Worker, WorkerKind, WorkerResponse, WorkerStatus,
};
