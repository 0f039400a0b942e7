//! Typed domain methods for the Deckflow API client.
//!
//! Request/response types are re-exported from `deckflow_core::models` so
//! the worker and the API agree on the wire shapes.

use crate::{api_prefix, ApiClient, Result};
use deckflow_core::models::{
    ClaimRequest, CompleteRequest, CreateTaskRequest, HeartbeatRequest, ProgressEventResponse,
    RegisterWorkerRequest, ReleaseRequest, ReportProgressRequest, TaskOutcome, TaskResponse,
    WorkerResponse,
};

impl ApiClient {
    /// Register this worker (idempotent).
    pub async fn register_worker(&self, req: &RegisterWorkerRequest) -> Result<WorkerResponse> {
        self.post_json(&format!("{}/workers/register", api_prefix()), req)
            .await
    }

    /// Refresh worker liveness with the current in-flight load.
    pub async fn heartbeat(&self, worker_id: &str, current_load: i32) -> Result<WorkerResponse> {
        self.post_json(
            &format!("{}/workers/{}/heartbeat", api_prefix(), worker_id),
            &HeartbeatRequest { current_load },
        )
        .await
    }

    /// Claim the next runnable task. `None` when nothing is runnable.
    pub async fn claim_task(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> Result<Option<TaskResponse>> {
        self.post_json_optional(
            &format!("{}/workers/{}/claim", api_prefix(), worker_id),
            &ClaimRequest {
                capabilities: capabilities.to_vec(),
            },
        )
        .await
    }

    /// Report progress on a leased task; also renews the lease.
    pub async fn report_progress(
        &self,
        task_id: i64,
        req: &ReportProgressRequest,
    ) -> Result<TaskResponse> {
        self.post_json(&format!("{}/tasks/{}/progress", api_prefix(), task_id), req)
            .await
    }

    /// Report a task outcome (success or failure).
    pub async fn complete_task(
        &self,
        task_id: i64,
        worker_id: &str,
        outcome: TaskOutcome,
    ) -> Result<TaskResponse> {
        self.post_json(
            &format!("{}/tasks/{}/complete", api_prefix(), task_id),
            &CompleteRequest {
                worker_id: worker_id.to_string(),
                outcome,
            },
        )
        .await
    }

    /// Return a leased task to the queue without consuming retry budget.
    pub async fn release_task(&self, task_id: i64, worker_id: &str) -> Result<TaskResponse> {
        self.post_json(
            &format!("{}/tasks/{}/release", api_prefix(), task_id),
            &ReleaseRequest {
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    /// Enqueue a task (dispatcher-side; used by tooling and tests).
    pub async fn create_task(&self, req: &CreateTaskRequest) -> Result<TaskResponse> {
        self.post_json(&format!("{}/tasks", api_prefix()), req).await
    }

    /// Fetch a task by id.
    pub async fn get_task(&self, task_id: i64) -> Result<TaskResponse> {
        self.get(&format!("{}/tasks/{}", api_prefix(), task_id), &[])
            .await
    }

    /// Fetch the progress log for a task.
    pub async fn get_task_progress(&self, task_id: i64) -> Result<Vec<ProgressEventResponse>> {
        #[derive(serde::Deserialize)]
        struct ProgressList {
            events: Vec<ProgressEventResponse>,
        }
        let list: ProgressList = self
            .get(&format!("{}/tasks/{}/progress", api_prefix(), task_id), &[])
            .await?;
        Ok(list.events)
    }
}
