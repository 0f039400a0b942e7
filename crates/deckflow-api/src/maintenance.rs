//! Background maintenance loops.
//!
//! Three periodic chores keep the queue honest independently of traffic:
//! the lease-expiry sweep (also promotes due retries), the worker liveness
//! sweep, and slow retention cleanup of finished tasks and pruned workers.
//! Claims run their own inline sweep as well, so these loops only bound the
//! staleness window when no worker is polling.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use deckflow_core::QueueConfig;
use deckflow_db::{TaskRepository, WorkerRepository};

const RETENTION_PASS_INTERVAL_SECS: u64 = 3600;

/// Handle to the spawned maintenance loop.
pub struct MaintenanceHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl MaintenanceHandle {
    /// Signals the loop to stop after its current chore.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Spawn the maintenance loop.
pub fn spawn_maintenance(
    tasks: TaskRepository,
    workers: WorkerRepository,
    queue: QueueConfig,
) -> MaintenanceHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let mut sweep_interval =
            interval(Duration::from_secs(queue.lease_sweep_interval_secs.max(1)));
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_retention_pass = Instant::now();

        tracing::info!(
            sweep_interval_secs = queue.lease_sweep_interval_secs,
            worker_grace_secs = queue.worker_grace_secs,
            task_retention_days = queue.task_retention_days,
            "Maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Maintenance loop shutting down");
                    break;
                }
                _ = sweep_interval.tick() => {
                    match tasks.sweep_expired_leases().await {
                        Ok(sweep) => {
                            if sweep.reclaimed > 0 || sweep.promoted > 0 {
                                tracing::info!(
                                    reclaimed = sweep.reclaimed,
                                    promoted = sweep.promoted,
                                    "Lease sweep completed"
                                );
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "Lease sweep failed"),
                    }

                    if let Err(e) = workers.sweep_inactive(queue.worker_grace_secs).await {
                        tracing::error!(error = %e, "Worker liveness sweep failed");
                    }

                    if last_retention_pass.elapsed().as_secs() >= RETENTION_PASS_INTERVAL_SECS {
                        last_retention_pass = Instant::now();
                        if queue.task_retention_days > 0 {
                            if let Err(e) =
                                tasks.delete_old_finished(queue.task_retention_days).await
                            {
                                tracing::error!(error = %e, "Task retention cleanup failed");
                            }
                        }
                        if let Err(e) =
                            workers.prune_inactive(queue.worker_prune_retention_secs).await
                        {
                            tracing::error!(error = %e, "Worker prune failed");
                        }
                    }
                }
            }
        }
    });

    MaintenanceHandle { shutdown_tx }
}
