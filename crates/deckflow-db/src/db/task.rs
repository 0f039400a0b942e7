//! Task repository: queue store, lease manager, progress recorder, and
//! completion handler.
//!
//! Every mutation commits in a transaction that preserves the lease
//! invariants: `locked_by` is non-null exactly while a task is
//! `processing`, at most one lease exists per task, and a task with
//! dependencies is never leased before they resolve. A claim is two such
//! steps: the expiry sweep commits first (its reclaims must survive a
//! no-match claim), then select-and-mark runs with
//! `FOR UPDATE SKIP LOCKED` so concurrent pollers never serialise on the
//! head-of-queue row and never observe the same task as available.

use sqlx::{PgPool, Postgres};

use deckflow_core::models::{
    ProgressEvent, Task, TaskErrorKind, TaskListQuery, TaskSpec, TaskState, TaskStats,
};
use deckflow_core::AppError;

/// Channel name for PostgreSQL LISTEN/NOTIFY when a new task is enqueued.
pub const TASK_NOTIFY_CHANNEL: &str = "deckflow_new_task";

const TASK_COLUMNS: &str = "id, deck_id, task_kind, priority, required_capabilities, file_path, \
     company_id, options, state, progress, current_step, progress_message, attempts, \
     max_attempts, next_retry_at, locked_by, locked_at, lock_expires_at, last_error, \
     error_code, error_count, result_path, result_metadata, completed_by, created_at, \
     started_at, completed_at, updated_at";

/// Computes backoff in seconds for a given attempt count (exponential with
/// cap): `min(base * 2^(attempts-1), cap)`.
#[inline]
pub(crate) fn compute_retry_backoff_seconds(attempts: i32, base_secs: i64, cap_secs: i64) -> i64 {
    let doublings = (attempts - 1).clamp(0, 30) as u32;
    base_secs.saturating_mul(1_i64 << doublings).min(cap_secs)
}

/// Outcome of a lease-expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseSweep {
    /// Tasks whose lease had expired and were returned to `queued`.
    pub reclaimed: u64,
    /// `retry` tasks whose deadline passed and became `queued`.
    pub promoted: u64,
}

#[derive(Clone)]
pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a new task with its dependency declarations.
    #[tracing::instrument(skip(self, spec), fields(task_kind = %spec.task_kind))]
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task, AppError> {
        if spec.max_attempts < 1 {
            return Err(AppError::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if spec.file_path.trim().is_empty() {
            return Err(AppError::InvalidInput("file_path must not be empty".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO tasks (deck_id, task_kind, priority, required_capabilities, file_path, \
             company_id, options, max_attempts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {TASK_COLUMNS}"
        );
        let task: Task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(spec.deck_id)
            .bind(spec.task_kind.to_string())
            .bind(spec.priority)
            .bind(&spec.required_capabilities)
            .bind(&spec.file_path)
            .bind(&spec.company_id)
            .bind(&spec.options)
            .bind(spec.max_attempts)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .is_some_and(|db| db.is_foreign_key_violation())
                {
                    AppError::InvalidInput(format!("unknown deck id {:?}", spec.deck_id))
                } else {
                    AppError::Database(e)
                }
            })?;

        for dep in &spec.dependencies {
            if dep.depends_on_id == task.id {
                return Err(AppError::InvalidInput(
                    "a task cannot depend on itself".to_string(),
                ));
            }
            sqlx::query(
                "INSERT INTO task_dependencies (task_id, depends_on_id, mode) VALUES ($1, $2, $3)",
            )
            .bind(task.id)
            .bind(dep.depends_on_id)
            .bind(dep.mode)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .is_some_and(|db| db.is_foreign_key_violation())
                {
                    AppError::InvalidInput(format!(
                        "unknown dependency task id {}",
                        dep.depends_on_id
                    ))
                } else {
                    AppError::Database(e)
                }
            })?;
        }

        // Wake polling workers immediately. Non-fatal: they discover new
        // tasks via polling when NOTIFY is unavailable.
        if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
            .bind(TASK_NOTIFY_CHANNEL)
            .execute(&mut *tx)
            .await
        {
            tracing::warn!(
                error = %e,
                task_id = task.id,
                "Failed to send pg_notify for new task, workers will discover it via polling"
            );
        }

        tx.commit().await?;

        tracing::info!(
            task_id = task.id,
            task_kind = %task.task_kind,
            priority = task.priority,
            deck_id = ?task.deck_id,
            dependencies = spec.dependencies.len(),
            "Task enqueued"
        );

        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>, AppError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    /// List tasks with optional state/kind filters, newest first.
    #[tracing::instrument(skip(self))]
    pub async fn list_tasks(&self, query: TaskListQuery) -> Result<Vec<Task>, AppError> {
        let limit = query.limit.unwrap_or(50).clamp(1, 1000);
        let offset = query.offset.unwrap_or(0).max(0);

        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE TRUE");
        let mut bind_count = 0;

        if query.state.is_some() {
            bind_count += 1;
            sql.push_str(&format!(" AND state = ${}", bind_count));
        }
        if query.task_kind.is_some() {
            bind_count += 1;
            sql.push_str(&format!(" AND task_kind = ${}", bind_count));
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            bind_count + 1,
            bind_count + 2
        ));

        let mut query_builder = sqlx::query_as::<_, Task>(&sql);
        if let Some(state) = query.state {
            query_builder = query_builder.bind(state);
        }
        if let Some(kind) = query.task_kind {
            query_builder = query_builder.bind(kind.to_string());
        }

        let tasks = query_builder
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    /// All tasks for a deck, newest first.
    #[tracing::instrument(skip(self))]
    pub async fn list_for_deck(&self, deck_id: i64) -> Result<Vec<Task>, AppError> {
        let sql =
            format!("SELECT {TASK_COLUMNS} FROM tasks WHERE deck_id = $1 ORDER BY created_at DESC");
        let tasks = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(deck_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    /// Atomically claim the next runnable task for a worker.
    ///
    /// Every claim first runs the lease-expiry / retry-promotion sweep and
    /// commits it, so reclaimed tasks survive even when nothing runnable
    /// matches this caller (`attempts` is untouched by the sweep; only
    /// explicit failure reports consume retry budget). The claim itself is
    /// then one transaction: the highest-priority runnable row whose
    /// dependencies are satisfied and whose capability requirements are a
    /// subset of `capabilities` is locked with SKIP LOCKED and marked
    /// `processing`.
    #[tracing::instrument(skip(self, capabilities))]
    pub async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
        lease_duration_secs: i64,
    ) -> Result<Option<Task>, AppError> {
        self.sweep_expired_leases().await?;

        let mut tx = self.pool.begin().await?;

        let select_sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE state = 'queued' \
               AND required_capabilities <@ $1 \
               AND NOT EXISTS ( \
                   SELECT 1 FROM task_dependencies d \
                   JOIN tasks u ON u.id = d.depends_on_id \
                   WHERE d.task_id = tasks.id \
                     AND ((d.mode = 'success_only' AND u.state <> 'completed') \
                       OR (d.mode = 'completion' AND u.state NOT IN ('completed', 'failed'))) \
               ) \
             ORDER BY priority DESC, created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        );
        let candidate: Option<Task> = sqlx::query_as::<Postgres, Task>(&select_sql)
            .bind(capabilities)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(candidate) = candidate else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let mark_sql = format!(
            "UPDATE tasks \
             SET state = 'processing', \
                 locked_by = $2, \
                 locked_at = NOW(), \
                 lock_expires_at = NOW() + make_interval(secs => $3), \
                 started_at = COALESCE(started_at, NOW()), \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {TASK_COLUMNS}"
        );
        let claimed: Task = sqlx::query_as::<Postgres, Task>(&mark_sql)
            .bind(candidate.id)
            .bind(worker_id)
            .bind(lease_duration_secs as f64)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            task_id = claimed.id,
            task_kind = %claimed.task_kind,
            worker_id = worker_id,
            "Task claimed"
        );

        Ok(Some(claimed))
    }

    /// Periodic lease-expiry and retry-promotion sweep, independent of
    /// claims.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired_leases(&self) -> Result<LeaseSweep, AppError> {
        let mut tx = self.pool.begin().await?;
        let sweep = Self::sweep_in_tx(&mut tx).await?;
        tx.commit().await?;

        if sweep.reclaimed > 0 {
            tracing::warn!(
                reclaimed = sweep.reclaimed,
                "Expired leases reclaimed; holders presumed crashed"
            );
        }
        Ok(sweep)
    }

    async fn sweep_in_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
    ) -> Result<LeaseSweep, AppError> {
        // Crashed leaseholders: clear the lease and requeue. `attempts` is
        // deliberately untouched; only explicit failure reports consume the
        // retry budget.
        let reclaimed = sqlx::query(
            "UPDATE tasks \
             SET state = 'queued', locked_by = NULL, locked_at = NULL, \
                 lock_expires_at = NULL, updated_at = NOW() \
             WHERE state = 'processing' AND lock_expires_at < NOW()",
        )
        .execute(&mut **tx)
        .await?
        .rows_affected();

        let promoted = sqlx::query(
            "UPDATE tasks \
             SET state = 'queued', next_retry_at = NULL, updated_at = NOW() \
             WHERE state = 'retry' AND next_retry_at <= NOW()",
        )
        .execute(&mut **tx)
        .await?
        .rows_affected();

        Ok(LeaseSweep {
            reclaimed,
            promoted,
        })
    }

    /// Extend a lease. Fails with lease-lost unless the caller holds it.
    #[tracing::instrument(skip(self))]
    pub async fn renew_lease(
        &self,
        task_id: i64,
        worker_id: &str,
        lease_duration_secs: i64,
    ) -> Result<Task, AppError> {
        let sql = format!(
            "UPDATE tasks \
             SET lock_expires_at = NOW() + make_interval(secs => $3), updated_at = NOW() \
             WHERE id = $1 AND locked_by = $2 AND state = 'processing' \
             RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .bind(worker_id)
            .bind(lease_duration_secs as f64)
            .fetch_optional(&self.pool)
            .await?;

        match task {
            Some(task) => Ok(task),
            None => Err(self.lease_lost(task_id, worker_id).await?),
        }
    }

    /// Gracefully park a task back to `queued` without consuming retry
    /// budget (e.g. worker shutdown).
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, task_id: i64, worker_id: &str) -> Result<Task, AppError> {
        let sql = format!(
            "UPDATE tasks \
             SET state = 'queued', locked_by = NULL, locked_at = NULL, \
                 lock_expires_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND locked_by = $2 AND state = 'processing' \
             RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        match task {
            Some(task) => {
                tracing::info!(task_id = task.id, worker_id, "Task released back to queue");
                Ok(task)
            }
            None => Err(self.lease_lost(task_id, worker_id).await?),
        }
    }

    /// Record progress and extend the lease (doubles as a heartbeat).
    /// When `step_name` is present a `started` progress event is appended.
    #[tracing::instrument(skip(self, message, step_data))]
    #[allow(clippy::too_many_arguments)]
    pub async fn report_progress(
        &self,
        task_id: i64,
        worker_id: &str,
        progress: i32,
        step_name: Option<&str>,
        message: Option<&str>,
        step_data: Option<serde_json::Value>,
        lease_duration_secs: i64,
    ) -> Result<Task, AppError> {
        if !(0..=100).contains(&progress) {
            return Err(AppError::InvalidInput(format!(
                "progress must be between 0 and 100, got {}",
                progress
            )));
        }
        // 100 is reserved for completion.
        let progress = progress.min(99);

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE tasks \
             SET progress = $3, \
                 current_step = COALESCE($4, current_step), \
                 progress_message = COALESCE($5, progress_message), \
                 lock_expires_at = NOW() + make_interval(secs => $6), \
                 updated_at = NOW() \
             WHERE id = $1 AND locked_by = $2 AND state = 'processing' \
             RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .bind(worker_id)
            .bind(progress)
            .bind(step_name)
            .bind(message)
            .bind(lease_duration_secs as f64)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(task) = task else {
            tx.rollback().await.ok();
            return Err(self.lease_lost(task_id, worker_id).await?);
        };

        if let Some(step_name) = step_name {
            sqlx::query(
                "INSERT INTO progress_events (task_id, step_name, step_status, progress, message, step_data) \
                 VALUES ($1, $2, 'started', $3, $4, $5)",
            )
            .bind(task_id)
            .bind(step_name)
            .bind(progress)
            .bind(message)
            .bind(step_data)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(task)
    }

    /// The append-only progress log for a task, oldest first.
    #[tracing::instrument(skip(self))]
    pub async fn list_progress(&self, task_id: i64) -> Result<Vec<ProgressEvent>, AppError> {
        if self.get_task(task_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Task {} not found", task_id)));
        }
        let events = sqlx::query_as::<Postgres, ProgressEvent>(
            "SELECT id, task_id, step_name, step_status, progress, message, step_data, created_at \
             FROM progress_events WHERE task_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Successful completion: terminal `completed`, result stored, lease
    /// cleared, parent deck updated in the same transaction.
    ///
    /// Idempotent for the completing worker: a repeat call answers the
    /// already-completed task. Any other caller gets lease-lost.
    #[tracing::instrument(skip(self, result_metadata))]
    pub async fn complete_success(
        &self,
        task_id: i64,
        worker_id: &str,
        result_path: &str,
        result_metadata: serde_json::Value,
    ) -> Result<Task, AppError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE tasks \
             SET state = 'completed', progress = 100, current_step = NULL, \
                 completed_at = NOW(), result_path = $3, result_metadata = $4, \
                 locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
                 completed_by = $2, updated_at = NOW() \
             WHERE id = $1 AND locked_by = $2 AND state = 'processing' \
             RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .bind(worker_id)
            .bind(result_path)
            .bind(&result_metadata)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(task) = task else {
            tx.rollback().await.ok();
            // Repeat success from the worker that already completed the task
            // is a no-op success; everything else is a lost lease.
            let current = self
                .get_task(task_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
            if current.state == TaskState::Completed
                && current.completed_by.as_deref() == Some(worker_id)
            {
                return Ok(current);
            }
            return Err(self.lease_lost(task_id, worker_id).await?);
        };

        if let Some(deck_id) = task.deck_id {
            sqlx::query(
                "UPDATE decks \
                 SET processing_status = 'completed', results_file_path = $2, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(deck_id)
            .bind(result_path)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            task_id = task.id,
            task_kind = %task.task_kind,
            worker_id,
            result_path,
            "Task completed"
        );

        Ok(task)
    }

    /// Failure report from the lease holder. Consumes one attempt: schedules
    /// a retry with exponential backoff while budget remains, otherwise
    /// settles in `failed`, marks the parent deck failed, and cascades
    /// `success_only` dependents.
    #[tracing::instrument(skip(self))]
    pub async fn complete_failure(
        &self,
        task_id: i64,
        worker_id: &str,
        error_message: &str,
        base_backoff_secs: i64,
        max_backoff_secs: i64,
    ) -> Result<Task, AppError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE");
        let current = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;

        if !current.is_leased_by(worker_id) {
            tx.rollback().await.ok();
            return Err(self.lease_lost(task_id, worker_id).await?);
        }

        let attempts = current.attempts + 1;
        let task = if attempts < current.max_attempts {
            let backoff_secs =
                compute_retry_backoff_seconds(attempts, base_backoff_secs, max_backoff_secs);
            let retry_sql = format!(
                "UPDATE tasks \
                 SET state = 'retry', attempts = $2, error_count = error_count + 1, \
                     last_error = $3, error_code = $4, \
                     next_retry_at = NOW() + make_interval(secs => $5), \
                     locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
                     updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING {TASK_COLUMNS}"
            );
            let task = sqlx::query_as::<Postgres, Task>(&retry_sql)
                .bind(task_id)
                .bind(attempts)
                .bind(error_message)
                .bind(TaskErrorKind::AnalysisFailed)
                .bind(backoff_secs as f64)
                .fetch_one(&mut *tx)
                .await?;

            tracing::info!(
                task_id,
                attempts,
                max_attempts = task.max_attempts,
                backoff_secs,
                "Task failed, retry scheduled"
            );
            task
        } else {
            let failed_sql = format!(
                "UPDATE tasks \
                 SET state = 'failed', attempts = $2, error_count = error_count + 1, \
                     last_error = $3, error_code = $4, completed_at = NOW(), \
                     locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
                     updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING {TASK_COLUMNS}"
            );
            let task = sqlx::query_as::<Postgres, Task>(&failed_sql)
                .bind(task_id)
                .bind(attempts)
                .bind(error_message)
                .bind(TaskErrorKind::AnalysisFailed)
                .fetch_one(&mut *tx)
                .await?;

            if let Some(deck_id) = task.deck_id {
                Self::mark_deck_failed(&mut tx, deck_id).await?;
            }
            Self::cascade_dependency_failures(
                &mut tx,
                vec![task.id],
                &format!(
                    "dependency cancelled: upstream task {} did not complete successfully",
                    task.id
                ),
            )
            .await?;

            tracing::error!(
                task_id,
                attempts,
                error = error_message,
                "Task failed permanently"
            );
            task
        };

        tx.commit().await?;
        Ok(task)
    }

    /// Idempotent cancel: forces a non-terminal task to `failed` with a
    /// synthetic error, releases any lease, and cascades `success_only`
    /// dependents. An in-flight worker observes the lost lease on its next
    /// progress or completion call.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: i64) -> Result<Task, AppError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE");
        let current = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;

        if current.is_terminal() {
            tx.rollback().await.ok();
            return Ok(current);
        }

        let cancel_sql = format!(
            "UPDATE tasks \
             SET state = 'failed', last_error = $2, error_code = $3, \
                 error_count = error_count + 1, completed_at = NOW(), \
                 locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<Postgres, Task>(&cancel_sql)
            .bind(task_id)
            .bind("task cancelled by request")
            .bind(TaskErrorKind::Cancelled)
            .fetch_one(&mut *tx)
            .await?;

        if let Some(deck_id) = task.deck_id {
            Self::mark_deck_failed(&mut tx, deck_id).await?;
        }
        Self::cascade_dependency_failures(
            &mut tx,
            vec![task.id],
            &format!("dependency cancelled: upstream task {} was cancelled", task.id),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(task_id, "Task cancelled");
        Ok(task)
    }

    /// Fail all `success_only` dependents of the given upstream tasks,
    /// recursively, marking each with the `dependency_failed` error kind so
    /// callers can tell a cascade from the dependent's own failure.
    /// `completion`-mode dependents stay runnable.
    async fn cascade_dependency_failures(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        mut upstream_ids: Vec<i64>,
        error_message: &str,
    ) -> Result<(), AppError> {
        while !upstream_ids.is_empty() {
            let failed: Vec<(i64, Option<i64>)> = sqlx::query_as(
                "UPDATE tasks t \
                 SET state = 'failed', last_error = $2, error_code = $3, \
                     error_count = t.error_count + 1, \
                     completed_at = NOW(), updated_at = NOW() \
                 FROM task_dependencies d \
                 WHERE d.task_id = t.id \
                   AND d.depends_on_id = ANY($1) \
                   AND d.mode = 'success_only' \
                   AND t.state IN ('queued', 'retry') \
                 RETURNING t.id, t.deck_id",
            )
            .bind(&upstream_ids)
            .bind(error_message)
            .bind(TaskErrorKind::DependencyFailed)
            .fetch_all(&mut **tx)
            .await?;

            if failed.is_empty() {
                break;
            }

            for (dependent_id, deck_id) in &failed {
                tracing::warn!(
                    task_id = dependent_id,
                    error = error_message,
                    "Dependent task failed with upstream"
                );
                if let Some(deck_id) = deck_id {
                    Self::mark_deck_failed(tx, *deck_id).await?;
                }
            }

            upstream_ids = failed.into_iter().map(|(id, _)| id).collect();
        }
        Ok(())
    }

    async fn mark_deck_failed(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        deck_id: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE decks SET processing_status = 'failed', updated_at = NOW() WHERE id = $1",
        )
        .bind(deck_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Aggregated task counts per state.
    #[tracing::instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<TaskStats, AppError> {
        use sqlx::Row;
        let row = sqlx::query(
            "SELECT \
                COUNT(*) as total, \
                COUNT(*) FILTER (WHERE state = 'queued') as queued, \
                COUNT(*) FILTER (WHERE state = 'processing') as processing, \
                COUNT(*) FILTER (WHERE state = 'completed') as completed, \
                COUNT(*) FILTER (WHERE state = 'failed') as failed, \
                COUNT(*) FILTER (WHERE state = 'retry') as retry \
             FROM tasks",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskStats {
            total: row.get::<Option<i64>, _>("total").unwrap_or(0),
            queued: row.get::<Option<i64>, _>("queued").unwrap_or(0),
            processing: row.get::<Option<i64>, _>("processing").unwrap_or(0),
            completed: row.get::<Option<i64>, _>("completed").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
            retry: row.get::<Option<i64>, _>("retry").unwrap_or(0),
        })
    }

    /// Delete finished tasks older than the given number of days. Keeps the
    /// tasks table bounded; progress events go with them via ON DELETE
    /// CASCADE. Returns the number of rows deleted.
    #[tracing::instrument(skip(self))]
    pub async fn delete_old_finished(&self, older_than_days: i32) -> Result<u64, AppError> {
        use sqlx::Row;
        let row = sqlx::query(
            "WITH deleted AS ( \
                DELETE FROM tasks \
                WHERE state IN ('completed', 'failed') \
                  AND COALESCE(completed_at, updated_at) < NOW() - ($1 * interval '1 day') \
                RETURNING id \
             ) \
             SELECT COUNT(*)::bigint FROM deleted",
        )
        .bind(older_than_days)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get(0);
        let count = count.max(0) as u64;
        if count > 0 {
            tracing::info!(count, older_than_days, "Deleted old finished tasks");
        }
        Ok(count)
    }

    /// Build the lease-lost error for a failed guard, distinguishing a
    /// missing task from a lease held elsewhere.
    async fn lease_lost(&self, task_id: i64, worker_id: &str) -> Result<AppError, AppError> {
        let current = self.get_task(task_id).await?;
        let err = match current {
            None => AppError::NotFound(format!("Task {} not found", task_id)),
            Some(task) => {
                tracing::warn!(
                    task_id,
                    worker_id,
                    state = %task.state,
                    holder = ?task.locked_by,
                    "Lease check failed"
                );
                AppError::LeaseLost(format!(
                    "worker {} does not hold the lease on task {} (state {})",
                    worker_id, task_id, task.state
                ))
            }
        };
        Ok(err)
    }
}
