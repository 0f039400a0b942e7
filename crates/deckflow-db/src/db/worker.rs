//! Worker registry: liveness tracking for the processes that execute tasks.
//!
//! Registration is idempotent and heartbeats upsert, so a worker record
//! exists from its first contact. Liveness is advisory only: leases held by
//! a dead worker are reclaimed by the task repository's expiry sweep, never
//! by the registry.

use sqlx::{PgPool, Postgres};

use deckflow_core::models::{RegisterWorkerRequest, Worker, WorkerStatus};
use deckflow_core::AppError;

const WORKER_COLUMNS: &str = "id, kind, capabilities, max_concurrent, current_load, status, \
     last_heartbeat, created_at, updated_at";

#[derive(Clone)]
pub struct WorkerRepository {
    pool: PgPool,
}

impl WorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent registration. Re-registering refreshes kind, capabilities,
    /// and concurrency cap, and reactivates the worker.
    #[tracing::instrument(skip(self, req), fields(worker_id = %req.worker_id))]
    pub async fn register(&self, req: &RegisterWorkerRequest) -> Result<Worker, AppError> {
        if req.worker_id.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "worker_id must not be empty".to_string(),
            ));
        }
        if req.max_concurrent < 1 {
            return Err(AppError::InvalidInput(
                "max_concurrent must be at least 1".to_string(),
            ));
        }

        let sql = format!(
            "INSERT INTO workers (id, kind, capabilities, max_concurrent, status, last_heartbeat) \
             VALUES ($1, $2, $3, $4, 'active', NOW()) \
             ON CONFLICT (id) DO UPDATE \
             SET kind = EXCLUDED.kind, \
                 capabilities = EXCLUDED.capabilities, \
                 max_concurrent = EXCLUDED.max_concurrent, \
                 status = 'active', \
                 last_heartbeat = NOW(), \
                 updated_at = NOW() \
             RETURNING {WORKER_COLUMNS}"
        );
        let worker = sqlx::query_as::<Postgres, Worker>(&sql)
            .bind(&req.worker_id)
            .bind(req.kind)
            .bind(&req.capabilities)
            .bind(req.max_concurrent)
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(
            worker_id = %worker.id,
            kind = %worker.kind,
            max_concurrent = worker.max_concurrent,
            "Worker registered"
        );
        Ok(worker)
    }

    /// Refresh liveness. Creates the record on first contact; reactivates an
    /// inactive worker but never one parked in maintenance.
    #[tracing::instrument(skip(self))]
    pub async fn heartbeat(&self, worker_id: &str, current_load: i32) -> Result<Worker, AppError> {
        let sql = format!(
            "INSERT INTO workers (id, current_load, last_heartbeat) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (id) DO UPDATE \
             SET current_load = EXCLUDED.current_load, \
                 last_heartbeat = NOW(), \
                 status = CASE WHEN workers.status = 'maintenance' \
                               THEN workers.status ELSE 'active' END, \
                 updated_at = NOW() \
             RETURNING {WORKER_COLUMNS}"
        );
        let worker = sqlx::query_as::<Postgres, Worker>(&sql)
            .bind(worker_id)
            .bind(current_load)
            .fetch_one(&self.pool)
            .await?;
        Ok(worker)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>, AppError> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1");
        let worker = sqlx::query_as::<Postgres, Worker>(&sql)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(worker)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_workers(&self) -> Result<Vec<Worker>, AppError> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id");
        let workers = sqlx::query_as::<Postgres, Worker>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(workers)
    }

    /// Operator control for draining a worker (`maintenance`) or putting it
    /// back into rotation.
    #[tracing::instrument(skip(self))]
    pub async fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<Worker, AppError> {
        let sql = format!(
            "UPDATE workers SET status = $2, updated_at = NOW() \
             WHERE id = $1 RETURNING {WORKER_COLUMNS}"
        );
        let worker = sqlx::query_as::<Postgres, Worker>(&sql)
            .bind(worker_id)
            .bind(status)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Worker {} not found", worker_id)))?;
        Ok(worker)
    }

    /// Mark workers inactive after missing heartbeats for the grace window.
    /// Returns the number of workers marked.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_inactive(&self, grace_secs: i64) -> Result<u64, AppError> {
        let marked = sqlx::query(
            "UPDATE workers SET status = 'inactive', updated_at = NOW() \
             WHERE status = 'active' AND last_heartbeat < NOW() - make_interval(secs => $1)",
        )
        .bind(grace_secs as f64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if marked > 0 {
            tracing::warn!(marked, grace_secs, "Workers marked inactive");
        }
        Ok(marked)
    }

    /// Delete workers that have been inactive longer than the retention
    /// window. Returns the number of rows deleted.
    #[tracing::instrument(skip(self))]
    pub async fn prune_inactive(&self, retention_secs: i64) -> Result<u64, AppError> {
        let pruned = sqlx::query(
            "DELETE FROM workers \
             WHERE status = 'inactive' AND last_heartbeat < NOW() - make_interval(secs => $1)",
        )
        .bind(retention_secs as f64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if pruned > 0 {
            tracing::info!(pruned, retention_secs, "Stale workers pruned");
        }
        Ok(pruned)
    }
}
