//! Worker loop: heartbeat, claim, analyse, complete.
//!
//! One logical loop per process. Claims are bounded by a semaphore sized to
//! `max_concurrent_tasks`; idle polls sleep a jittered 2-5 s so a fleet of
//! workers does not thundering-herd the queue. A task, once analysed, is
//! never abandoned: the completion call is retried until the queue accepts
//! it or answers lease-lost. Shutdown stops claiming, cancels in-flight
//! analysers, and releases still-held leases.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use deckflow_api_client::{ApiClient, ClientError};
use deckflow_core::models::{
    RegisterWorkerRequest, ReportProgressRequest, TaskOutcome, TaskResponse, WorkerKind,
};
use deckflow_core::WorkerConfig;

use crate::analyzer::{Analyzer, ProgressSink};

const MAX_COMPLETION_RETRY_SECS: u64 = 60;
const REGISTER_RETRY_SECS: u64 = 5;

/// Delay before the nth retry of a completion call (exponential, capped).
#[inline]
fn completion_retry_delay(attempt: u32) -> Duration {
    Duration::from_secs((1_u64 << attempt.min(6)).min(MAX_COMPLETION_RETRY_SECS))
}

/// Jittered idle poll interval in milliseconds.
fn jittered_poll_ms(min_secs: u64, max_secs: u64) -> u64 {
    let min_ms = min_secs * 1000;
    let max_ms = max_secs.max(min_secs) * 1000;
    if min_ms == max_ms {
        return min_ms;
    }
    rand::rng().random_range(min_ms..=max_ms)
}

/// Progress reporting bridge from the analyser to the API. Every report
/// renews the lease; a lease-lost answer cancels the analysis.
struct ApiProgressSink {
    client: ApiClient,
    task_id: i64,
    worker_id: String,
    cancel: CancellationToken,
    lease_lost: AtomicBool,
    last_progress: AtomicI32,
}

impl ApiProgressSink {
    fn new(client: ApiClient, task_id: i64, worker_id: String, cancel: CancellationToken) -> Self {
        Self {
            client,
            task_id,
            worker_id,
            cancel,
            lease_lost: AtomicBool::new(false),
            last_progress: AtomicI32::new(0),
        }
    }

    fn lease_is_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        progress: i32,
        step_name: Option<&str>,
        message: Option<&str>,
    ) -> Result<()> {
        let result = self
            .client
            .report_progress(
                self.task_id,
                &ReportProgressRequest {
                    worker_id: self.worker_id.clone(),
                    progress,
                    step_name: step_name.map(str::to_string),
                    message: message.map(str::to_string),
                    step_data: None,
                },
            )
            .await;

        match result {
            Ok(_) => {
                self.last_progress.store(progress, Ordering::SeqCst);
                Ok(())
            }
            Err(ClientError::LeaseLost(reason)) => {
                tracing::warn!(
                    task_id = self.task_id,
                    reason = %reason,
                    "Lease lost, aborting analysis"
                );
                self.lease_lost.store(true, Ordering::SeqCst);
                self.cancel.cancel();
                Err(anyhow::anyhow!("lease lost: {}", reason))
            }
            Err(e) if e.is_retryable() => {
                // Transient: keep analysing, the keep-alive loop will renew
                // the lease on its next tick.
                tracing::warn!(task_id = self.task_id, error = %e, "Progress report failed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProgressSink for ApiProgressSink {
    async fn report(
        &self,
        progress: i32,
        step_name: Option<&str>,
        message: Option<&str>,
    ) -> Result<()> {
        self.send(progress, step_name, message).await
    }
}

pub struct WorkerRunner {
    client: ApiClient,
    analyzer: Arc<dyn Analyzer>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerRunner {
    pub fn new(
        client: ApiClient,
        analyzer: Arc<dyn Analyzer>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            analyzer,
            config,
            shutdown,
        }
    }

    fn worker_kind(&self) -> WorkerKind {
        match self.config.worker_kind.as_str() {
            "gpu" => WorkerKind::Gpu,
            _ => WorkerKind::Cpu,
        }
    }

    /// Register with the API, retrying until it succeeds or shutdown fires.
    async fn register_with_retry(&self) -> Result<()> {
        let request = RegisterWorkerRequest {
            worker_id: self.config.worker_id.clone(),
            kind: self.worker_kind(),
            capabilities: self.config.capabilities.clone(),
            max_concurrent: self.config.max_concurrent_tasks as i32,
        };

        loop {
            match self.client.register_worker(&request).await {
                Ok(worker) => {
                    tracing::info!(
                        worker_id = %worker.id,
                        kind = %worker.kind,
                        max_concurrent = worker.max_concurrent,
                        "Worker registered"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Worker registration failed, retrying");
                    tokio::select! {
                        _ = sleep(Duration::from_secs(REGISTER_RETRY_SECS)) => {}
                        _ = self.shutdown.cancelled() => {
                            anyhow::bail!("shutdown before registration completed");
                        }
                    }
                }
            }
        }
    }

    /// The main loop. Returns once shutdown has drained in-flight tasks.
    pub async fn run(self) -> Result<()> {
        self.register_with_retry().await?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs.max(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            worker_id = %self.config.worker_id,
            max_concurrent = self.config.max_concurrent_tasks,
            poll_secs = format!(
                "{}-{}",
                self.config.claim_poll_min_secs, self.config.claim_poll_max_secs
            ),
            "Worker loop started"
        );

        loop {
            // Reap finished task handlers without blocking.
            while in_flight.try_join_next().is_some() {}

            let poll_ms = jittered_poll_ms(
                self.config.claim_poll_min_secs,
                self.config.claim_poll_max_secs,
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    let load = self.config.max_concurrent_tasks
                        - semaphore.available_permits();
                    if let Err(e) = self
                        .client
                        .heartbeat(&self.config.worker_id, load as i32)
                        .await
                    {
                        tracing::warn!(error = %e, "Heartbeat failed");
                    }
                }
                _ = sleep(Duration::from_millis(poll_ms)) => {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        continue;
                    };

                    match self
                        .client
                        .claim_task(&self.config.worker_id, &self.config.capabilities)
                        .await
                    {
                        Ok(Some(task)) => {
                            let client = self.client.clone();
                            let analyzer = self.analyzer.clone();
                            let config = self.config.clone();
                            let shutdown = self.shutdown.clone();
                            in_flight.spawn(async move {
                                let _permit = permit;
                                run_task(client, analyzer, config, task, shutdown).await;
                            });
                        }
                        Ok(None) => drop(permit),
                        Err(e) => {
                            drop(permit);
                            tracing::warn!(error = %e, "Claim failed");
                        }
                    }
                }
            }
        }

        tracing::info!(
            in_flight = in_flight.len(),
            grace_secs = self.config.shutdown_grace_secs,
            "Worker shutting down, draining in-flight tasks"
        );

        // In-flight handlers observe the cancelled token, release their
        // leases, and exit; give them a bounded grace period.
        let drain = async {
            while in_flight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(self.config.shutdown_grace_secs), drain)
            .await
            .is_err()
        {
            tracing::warn!("Shutdown grace expired; remaining leases will expire on their own");
            in_flight.abort_all();
        }

        tracing::info!("Worker stopped");
        Ok(())
    }
}

/// Drive one claimed task to a terminal report.
async fn run_task(
    client: ApiClient,
    analyzer: Arc<dyn Analyzer>,
    config: WorkerConfig,
    task: TaskResponse,
    shutdown: CancellationToken,
) {
    let task_id = task.id;
    let cancel = CancellationToken::new();
    let sink = Arc::new(ApiProgressSink::new(
        client.clone(),
        task_id,
        config.worker_id.clone(),
        cancel.clone(),
    ));

    tracing::info!(task_id, task_kind = %task.task_kind, "Task started");

    // Keep-alive: renew the lease at a steady cadence while the analyser
    // runs, and propagate an external shutdown into the analysis.
    let keepalive = {
        let sink = sink.clone();
        let cancel = cancel.clone();
        let shutdown = shutdown.clone();
        let interval_secs = config.progress_interval_secs.max(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => {
                        cancel.cancel();
                        break;
                    }
                    _ = sleep(Duration::from_secs(interval_secs)) => {
                        let progress = sink.last_progress.load(Ordering::SeqCst);
                        let _ = sink.send(progress, None, None).await;
                        if sink.lease_is_lost() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let analysis = analyzer.analyze(&task, sink.as_ref(), &cancel).await;
    cancel.cancel();
    keepalive.await.ok();

    if sink.lease_is_lost() {
        // Another holder owns the task now (cancel, expiry, or reclaim);
        // any result we produced is void.
        tracing::warn!(task_id, "Attempt abandoned after lease loss");
        return;
    }

    if shutdown.is_cancelled() {
        // Graceful shutdown: park the task for another worker without
        // consuming retry budget.
        match client.release_task(task_id, &config.worker_id).await {
            Ok(_) => tracing::info!(task_id, "Task released on shutdown"),
            Err(e) => tracing::warn!(task_id, error = %e, "Release failed; lease will expire"),
        }
        return;
    }

    let outcome = match analysis {
        Ok(outcome) => {
            tracing::info!(task_id, result_path = %outcome.result_path, "Analysis succeeded");
            TaskOutcome::Success {
                result_path: outcome.result_path,
                metadata: outcome.metadata,
            }
        }
        Err(e) => {
            tracing::error!(task_id, error = %e, "Analysis failed");
            TaskOutcome::Failure {
                error: e.to_string(),
            }
        }
    };

    // Once analysis has concluded the task must not be abandoned: retry the
    // completion call until the queue accepts it or tells us the lease is
    // gone.
    let mut attempt: u32 = 0;
    loop {
        match client
            .complete_task(task_id, &config.worker_id, outcome.clone())
            .await
        {
            Ok(completed) => {
                tracing::info!(task_id, state = %completed.state, "Outcome recorded");
                break;
            }
            Err(ClientError::LeaseLost(reason)) => {
                tracing::warn!(task_id, reason = %reason, "Outcome rejected, lease lost");
                break;
            }
            Err(e) if e.is_retryable() => {
                let delay = completion_retry_delay(attempt);
                attempt += 1;
                tracing::warn!(
                    task_id,
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "Completion call failed, will retry"
                );
                sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "Completion rejected permanently");
                break;
            }
        }
    }
}
