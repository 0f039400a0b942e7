//! Worker registry lifecycle: registration, heartbeats, liveness sweeps,
//! pruning, and the stats endpoint.

mod helpers;

use helpers::{age_worker_heartbeat, api_path, setup_test_app};
use serde_json::json;

use deckflow_core::models::{WorkerStatus, TaskKind, TaskSpec};

fn spec(kind: TaskKind) -> TaskSpec {
    TaskSpec {
        deck_id: None,
        task_kind: kind,
        priority: 5,
        required_capabilities: vec![],
        file_path: "/shared/decks/w.pdf".to_string(),
        company_id: "w-co".to_string(),
        options: json!({}),
        max_attempts: 3,
        dependencies: vec![],
    }
}

/// Registration is idempotent and refreshes capabilities.
#[tokio::test]
async fn register_is_idempotent() {
    let app = setup_test_app().await;

    let response = app
        .client()
        .post(&api_path("/workers/register"))
        .json(&json!({
            "worker_id": "gpu-host-1",
            "kind": "gpu",
            "capabilities": ["cuda"],
            "max_concurrent": 2
        }))
        .await;
    response.assert_status_ok();

    let response = app
        .client()
        .post(&api_path("/workers/register"))
        .json(&json!({
            "worker_id": "gpu-host-1",
            "kind": "gpu",
            "capabilities": ["cuda", "tensorrt"],
            "max_concurrent": 4
        }))
        .await;
    response.assert_status_ok();
    let worker: serde_json::Value = response.json();
    assert_eq!(worker["max_concurrent"], 4);
    assert_eq!(worker["capabilities"], json!(["cuda", "tensorrt"]));
    assert_eq!(worker["status"], "active");

    let response = app.client().get(&api_path("/workers")).await;
    response.assert_status_ok();
    let listing: serde_json::Value = response.json();
    assert_eq!(listing["count"], 1);
}

/// A worker record is created on first heartbeat, without registration.
#[tokio::test]
async fn heartbeat_creates_the_worker() {
    let app = setup_test_app().await;

    let response = app
        .client()
        .post(&api_path("/workers/fresh-host-9/heartbeat"))
        .json(&json!({"current_load": 1}))
        .await;
    response.assert_status_ok();
    let worker: serde_json::Value = response.json();
    assert_eq!(worker["id"], "fresh-host-9");
    assert_eq!(worker["status"], "active");
    assert_eq!(worker["kind"], "cpu");
    assert_eq!(worker["current_load"], 1);
}

/// Missed heartbeats mark a worker inactive; a new heartbeat reactivates it.
/// Workers parked in maintenance stay parked.
#[tokio::test]
async fn liveness_sweep_and_reactivation() {
    let app = setup_test_app().await;
    let workers = &app.state.workers;

    workers.heartbeat("host-a", 0).await.unwrap();
    workers.heartbeat("host-b", 0).await.unwrap();
    workers
        .set_status("host-b", WorkerStatus::Maintenance)
        .await
        .unwrap();

    age_worker_heartbeat(&app, "host-a", 120).await;
    let marked = workers.sweep_inactive(60).await.unwrap();
    assert_eq!(marked, 1);

    let host_a = workers.get_worker("host-a").await.unwrap().unwrap();
    assert_eq!(host_a.status, WorkerStatus::Inactive);

    // Heartbeat brings an inactive worker back but never a maintenance one.
    let host_a = workers.heartbeat("host-a", 0).await.unwrap();
    assert_eq!(host_a.status, WorkerStatus::Active);
    let host_b = workers.heartbeat("host-b", 0).await.unwrap();
    assert_eq!(host_b.status, WorkerStatus::Maintenance);
}

/// Stale inactive workers are pruned after the retention window; active
/// ones are untouched.
#[tokio::test]
async fn stale_inactive_workers_are_pruned() {
    let app = setup_test_app().await;
    let workers = &app.state.workers;

    workers.heartbeat("old-host", 0).await.unwrap();
    workers.heartbeat("live-host", 0).await.unwrap();

    age_worker_heartbeat(&app, "old-host", 7200).await;
    workers.sweep_inactive(60).await.unwrap();
    let pruned = workers.prune_inactive(3600).await.unwrap();
    assert_eq!(pruned, 1);

    assert!(workers.get_worker("old-host").await.unwrap().is_none());
    assert!(workers.get_worker("live-host").await.unwrap().is_some());
}

/// A worker going inactive does not touch its leases; the lease sweep
/// reclaims them independently.
#[tokio::test]
async fn inactive_worker_keeps_lease_until_expiry() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;
    let workers = &app.state.workers;

    workers.heartbeat("doomed-host", 0).await.unwrap();
    let task = tasks.create_task(spec(TaskKind::PdfAnalysis)).await.unwrap();
    tasks.claim_next("doomed-host", &[], 1).await.unwrap().unwrap();

    age_worker_heartbeat(&app, "doomed-host", 120).await;
    workers.sweep_inactive(60).await.unwrap();

    // The lease is still held until it expires on its own clock.
    let held = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(held.locked_by.as_deref(), Some("doomed-host"));

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    let sweep = tasks.sweep_expired_leases().await.unwrap();
    assert_eq!(sweep.reclaimed, 1);

    let freed = tasks.get_task(task.id).await.unwrap().unwrap();
    assert!(freed.locked_by.is_none());
    assert_eq!(freed.attempts, 0);
}

/// Stats aggregate counts per state; retention cleanup removes only old
/// terminal tasks.
#[tokio::test]
async fn stats_and_retention() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let queued = tasks.create_task(spec(TaskKind::PdfAnalysis)).await.unwrap();
    let done = tasks.create_task(spec(TaskKind::VisualAnalysis)).await.unwrap();
    tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();
    // Claim order is by priority then age, so `queued` was claimed first.
    tasks
        .complete_success(queued.id, "w1", "/shared/results/q.json", json!({}))
        .await
        .unwrap();

    let response = app.client().get(&api_path("/tasks/stats")).await;
    response.assert_status_ok();
    let stats: serde_json::Value = response.json();
    assert_eq!(stats["total"], 2);
    assert_eq!(stats["completed"], 1);
    assert_eq!(stats["queued"], 1);

    // Fresh terminal tasks survive retention; aged ones are deleted.
    assert_eq!(tasks.delete_old_finished(30).await.unwrap(), 0);
    sqlx::query("UPDATE tasks SET completed_at = NOW() - interval '60 days' WHERE id = $1")
        .bind(queued.id)
        .execute(app.pool())
        .await
        .unwrap();
    assert_eq!(tasks.delete_old_finished(30).await.unwrap(), 1);
    assert!(tasks.get_task(queued.id).await.unwrap().is_none());
    assert!(tasks.get_task(done.id).await.unwrap().is_some());
}
