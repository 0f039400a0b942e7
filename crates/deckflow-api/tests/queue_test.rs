//! End-to-end queue scenarios over the HTTP surface and the repositories:
//! happy path, crash-resume, retry with backoff, concurrent claimants, and
//! cancellation mid-flight.

mod helpers;

use axum::http::StatusCode;
use helpers::{
    api_path, create_test_deck, make_retry_due, register_test_worker, setup_test_app,
};
use serde_json::json;

use deckflow_core::models::{
    DependencyMode, DependencySpec, TaskErrorKind, TaskKind, TaskSpec, TaskState,
};
use deckflow_core::AppError;

fn plain_spec(deck_id: Option<i64>, kind: TaskKind) -> TaskSpec {
    TaskSpec {
        deck_id,
        task_kind: kind,
        priority: 5,
        required_capabilities: vec![],
        file_path: "/shared/decks/acme.pdf".to_string(),
        company_id: "acme".to_string(),
        options: json!({}),
        max_attempts: 3,
        dependencies: vec![],
    }
}

/// Happy path: enqueue, claim, progress three times, complete with success.
/// The task ends completed at 100% and the deck carries the result path.
#[tokio::test]
async fn happy_path_completes_task_and_deck() {
    let app = setup_test_app().await;
    let deck_id = create_test_deck(&app, "acme").await;
    register_test_worker(&app, "w1").await;

    let response = app
        .client()
        .post(&api_path("/tasks"))
        .json(&json!({
            "deck_id": deck_id,
            "task_kind": "pdf_analysis",
            "file_path": "/shared/decks/acme.pdf",
            "company_id": "acme",
            "priority": 1
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let task: serde_json::Value = response.json();
    let task_id = task["id"].as_i64().expect("task id");
    assert_eq!(task["state"], "queued");

    let response = app
        .client()
        .post(&api_path("/workers/w1/claim"))
        .json(&json!({"capabilities": []}))
        .await;
    response.assert_status_ok();
    let claimed: serde_json::Value = response.json();
    assert_eq!(claimed["id"].as_i64(), Some(task_id));
    assert_eq!(claimed["state"], "processing");

    for (progress, step) in [(25, "parsing"), (50, "vision"), (75, "scoring")] {
        let response = app
            .client()
            .post(&api_path(&format!("/tasks/{}/progress", task_id)))
            .json(&json!({
                "worker_id": "w1",
                "progress": progress,
                "step_name": step
            }))
            .await;
        response.assert_status_ok();
    }

    let response = app
        .client()
        .post(&api_path(&format!("/tasks/{}/complete", task_id)))
        .json(&json!({
            "worker_id": "w1",
            "outcome": "success",
            "result_path": "/shared/results/42.json"
        }))
        .await;
    response.assert_status_ok();
    let completed: serde_json::Value = response.json();
    assert_eq!(completed["state"], "completed");
    assert_eq!(completed["progress"], 100);
    assert_eq!(completed["result_path"], "/shared/results/42.json");

    let response = app
        .client()
        .get(&api_path(&format!("/decks/{}", deck_id)))
        .await;
    response.assert_status_ok();
    let deck: serde_json::Value = response.json();
    assert_eq!(deck["processing_status"], "completed");
    assert_eq!(deck["results_file_path"], "/shared/results/42.json");

    let response = app
        .client()
        .get(&api_path(&format!("/tasks/{}/progress", task_id)))
        .await;
    response.assert_status_ok();
    let log: serde_json::Value = response.json();
    assert_eq!(log["count"], 3);
    assert_eq!(log["events"][0]["step_name"], "parsing");
}

/// Crash-resume: a lease that expires without a failure report is swept back
/// to queued with `attempts` untouched, and another worker finishes the
/// task exactly once.
#[tokio::test]
async fn expired_lease_is_reclaimed_without_burning_retries() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let task = tasks
        .create_task(plain_spec(None, TaskKind::PdfAnalysis))
        .await
        .expect("enqueue");

    // W1 claims with a one-second lease and reports some progress.
    let claimed = tasks
        .claim_next("w1", &[], 1)
        .await
        .expect("claim")
        .expect("task should be runnable");
    assert_eq!(claimed.id, task.id);
    tasks
        .report_progress(task.id, "w1", 40, Some("vision"), None, None, 1)
        .await
        .expect("progress");

    // The worker dies. After the lease expires the next claim sweeps the
    // lease and hands the task to W2 with the retry budget intact.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    let reclaimed = tasks
        .claim_next("w2", &[], 60)
        .await
        .expect("claim")
        .expect("expired task should be runnable again");
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.attempts, 0);
    assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));

    // W1's late success is rejected; W2's completion wins exactly once.
    let late = tasks
        .complete_success(task.id, "w1", "/shared/results/late.json", json!({}))
        .await;
    assert!(matches!(late, Err(AppError::LeaseLost(_))));

    let done = tasks
        .complete_success(task.id, "w2", "/shared/results/ok.json", json!({}))
        .await
        .expect("w2 completion");
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.attempts, 0);
}

/// Retry with backoff: each failure doubles the delay until the budget is
/// exhausted, then the task settles in failed and the deck follows.
#[tokio::test]
async fn failures_retry_with_exponential_backoff_then_settle() {
    let app = setup_test_app().await;
    let deck_id = create_test_deck(&app, "retry-co").await;
    let tasks = &app.state.tasks;

    let task = tasks
        .create_task(plain_spec(Some(deck_id), TaskKind::PdfAnalysis))
        .await
        .expect("enqueue");

    // Attempt 1: backoff ~60s.
    tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();
    let after_first = tasks
        .complete_failure(task.id, "w1", "oom", 60, 3600)
        .await
        .expect("failure report");
    assert_eq!(after_first.state, TaskState::Retry);
    assert_eq!(after_first.attempts, 1);
    let delay = (after_first.next_retry_at.unwrap() - chrono::Utc::now()).num_seconds();
    assert!((50..=70).contains(&delay), "first backoff was {}s", delay);

    // Not due yet: nothing is runnable.
    assert!(tasks.claim_next("w1", &[], 60).await.unwrap().is_none());

    // Attempt 2: backoff ~120s.
    make_retry_due(&app, task.id).await;
    tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();
    let after_second = tasks
        .complete_failure(task.id, "w1", "oom", 60, 3600)
        .await
        .expect("failure report");
    assert_eq!(after_second.state, TaskState::Retry);
    assert_eq!(after_second.attempts, 2);
    let delay = (after_second.next_retry_at.unwrap() - chrono::Utc::now()).num_seconds();
    assert!((110..=130).contains(&delay), "second backoff was {}s", delay);

    // Attempt 3 exhausts the budget.
    make_retry_due(&app, task.id).await;
    tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();
    let after_third = tasks
        .complete_failure(task.id, "w1", "oom", 60, 3600)
        .await
        .expect("failure report");
    assert_eq!(after_third.state, TaskState::Failed);
    assert_eq!(after_third.attempts, 3);
    assert!(!after_third.can_retry());
    assert_eq!(after_third.last_error.as_deref(), Some("oom"));
    assert_eq!(after_third.error_code, Some(TaskErrorKind::AnalysisFailed));

    assert!(tasks.claim_next("w1", &[], 60).await.unwrap().is_none());
    let deck = app.state.decks.get_deck(deck_id).await.unwrap().unwrap();
    assert_eq!(
        serde_json::to_value(deck.processing_status).unwrap(),
        json!("failed")
    );
}

/// Ten concurrent claimants, one runnable task: exactly one wins.
#[tokio::test]
async fn concurrent_claims_hand_out_the_task_once() {
    let app = setup_test_app().await;
    let tasks = app.state.tasks.clone();

    tasks
        .create_task(plain_spec(None, TaskKind::VisualAnalysis))
        .await
        .expect("enqueue");

    let mut join_set = tokio::task::JoinSet::new();
    for n in 0..10 {
        let tasks = tasks.clone();
        join_set.spawn(async move {
            tasks
                .claim_next(&format!("w{}", n), &[], 60)
                .await
                .expect("claim should not error")
        });
    }

    let mut winners = 0;
    while let Some(result) = join_set.join_next().await {
        if result.expect("claimant panicked").is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one claimant may win the task");
}

/// Cancel during processing: the worker's next progress report answers
/// lease-lost and the task is failed, never completed.
#[tokio::test]
async fn cancel_mid_flight_rejects_the_worker() {
    let app = setup_test_app().await;
    let deck_id = create_test_deck(&app, "cancel-co").await;
    register_test_worker(&app, "w1").await;

    let response = app
        .client()
        .post(&api_path("/tasks"))
        .json(&json!({
            "deck_id": deck_id,
            "task_kind": "visual_analysis",
            "file_path": "/shared/decks/cancel-co.pdf",
            "company_id": "cancel-co"
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let task: serde_json::Value = response.json();
    let task_id = task["id"].as_i64().unwrap();

    let response = app
        .client()
        .post(&api_path("/workers/w1/claim"))
        .json(&json!({"capabilities": []}))
        .await;
    response.assert_status_ok();

    let response = app
        .client()
        .post(&api_path(&format!("/tasks/{}/progress", task_id)))
        .json(&json!({"worker_id": "w1", "progress": 60}))
        .await;
    response.assert_status_ok();

    let response = app
        .client()
        .post(&api_path(&format!("/tasks/{}/cancel", task_id)))
        .await;
    response.assert_status_ok();
    let cancelled: serde_json::Value = response.json();
    assert_eq!(cancelled["state"], "failed");

    // The worker is now a stranger to the task.
    let response = app
        .client()
        .post(&api_path(&format!("/tasks/{}/progress", task_id)))
        .json(&json!({"worker_id": "w1", "progress": 80}))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let error: serde_json::Value = response.json();
    assert_eq!(error["code"], "lease_lost");

    // A late success must not supersede the cancellation.
    let response = app
        .client()
        .post(&api_path(&format!("/tasks/{}/complete", task_id)))
        .json(&json!({
            "worker_id": "w1",
            "outcome": "success",
            "result_path": "/shared/results/ghost.json"
        }))
        .await;
    response.assert_status(StatusCode::CONFLICT);

    let task = app.state.tasks.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.last_error.as_deref(), Some("task cancelled by request"));
    assert_eq!(task.error_code, Some(TaskErrorKind::Cancelled));
}

/// Cancel is idempotent: repeat calls succeed without changing anything.
#[tokio::test]
async fn cancel_is_idempotent() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let task = tasks
        .create_task(plain_spec(None, TaskKind::PdfAnalysis))
        .await
        .unwrap();

    let first = tasks.cancel_task(task.id).await.expect("first cancel");
    assert_eq!(first.state, TaskState::Failed);
    let error_count = first.error_count;

    let second = tasks.cancel_task(task.id).await.expect("repeat cancel");
    assert_eq!(second.state, TaskState::Failed);
    assert_eq!(second.error_count, error_count);
}

/// complete(success) is idempotent for the completing worker and lease-lost
/// for anyone else.
#[tokio::test]
async fn complete_success_idempotency() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let task = tasks
        .create_task(plain_spec(None, TaskKind::PdfAnalysis))
        .await
        .unwrap();
    tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();

    let first = tasks
        .complete_success(task.id, "w1", "/shared/results/1.json", json!({}))
        .await
        .expect("completion");
    assert_eq!(first.state, TaskState::Completed);

    let repeat = tasks
        .complete_success(task.id, "w1", "/shared/results/1.json", json!({}))
        .await
        .expect("repeat completion is a no-op success");
    assert_eq!(repeat.state, TaskState::Completed);
    assert_eq!(repeat.completed_by.as_deref(), Some("w1"));

    let foreign = tasks
        .complete_success(task.id, "w2", "/shared/results/2.json", json!({}))
        .await;
    assert!(matches!(foreign, Err(AppError::LeaseLost(_))));
}

/// Renewal extends the lease for the holder and is lease-lost for anyone
/// else.
#[tokio::test]
async fn renew_extends_the_lease_for_the_holder_only() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let task = tasks
        .create_task(plain_spec(None, TaskKind::PdfAnalysis))
        .await
        .unwrap();
    let claimed = tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();
    let deadline = claimed.lock_expires_at.unwrap();

    let renewed = tasks.renew_lease(task.id, "w1", 600).await.expect("renew");
    assert!(renewed.lock_expires_at.unwrap() > deadline);

    let stranger = tasks.renew_lease(task.id, "w2", 600).await;
    assert!(matches!(stranger, Err(AppError::LeaseLost(_))));
}

/// Release parks the task back in the queue without consuming the retry
/// budget; a later claim starts clean.
#[tokio::test]
async fn release_returns_task_to_queue() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let task = tasks
        .create_task(plain_spec(None, TaskKind::TemplateProcessing))
        .await
        .unwrap();
    tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();

    let released = tasks.release(task.id, "w1").await.expect("release");
    assert_eq!(released.state, TaskState::Queued);
    assert_eq!(released.attempts, 0);
    assert!(released.locked_by.is_none());

    let reclaimed = tasks.claim_next("w2", &[], 60).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));

    // Release from a non-holder is lease-lost.
    let stranger = tasks.release(task.id, "w1").await;
    assert!(matches!(stranger, Err(AppError::LeaseLost(_))));
}

/// Claim with an empty queue answers 204 without side effects; claims skip
/// tasks whose capability requirements the worker cannot satisfy.
#[tokio::test]
async fn claim_respects_capabilities_and_empty_queue() {
    let app = setup_test_app().await;
    register_test_worker(&app, "w1").await;

    let response = app
        .client()
        .post(&api_path("/workers/w1/claim"))
        .json(&json!({"capabilities": []}))
        .await;
    response.assert_status(StatusCode::NO_CONTENT);

    let mut spec = plain_spec(None, TaskKind::VisualAnalysis);
    spec.required_capabilities = vec!["cuda".to_string()];
    let task = app.state.tasks.create_task(spec).await.unwrap();

    // Capability mismatch: still nothing runnable for this worker.
    let response = app
        .client()
        .post(&api_path("/workers/w1/claim"))
        .json(&json!({"capabilities": ["opencl"]}))
        .await;
    response.assert_status(StatusCode::NO_CONTENT);

    // A superset of the requirements wins the task.
    let response = app
        .client()
        .post(&api_path("/workers/w1/claim"))
        .json(&json!({"capabilities": ["cuda", "tensorrt"]}))
        .await;
    response.assert_status_ok();
    let claimed: serde_json::Value = response.json();
    assert_eq!(claimed["id"].as_i64(), Some(task.id));
}

/// Higher priority wins; equal priority is claimed oldest first.
#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let mut low = plain_spec(None, TaskKind::PdfAnalysis);
    low.priority = 1;
    let low = tasks.create_task(low).await.unwrap();

    let mut old_normal = plain_spec(None, TaskKind::PdfAnalysis);
    old_normal.priority = 5;
    let old_normal = tasks.create_task(old_normal).await.unwrap();

    let mut new_normal = plain_spec(None, TaskKind::PdfAnalysis);
    new_normal.priority = 5;
    let new_normal = tasks.create_task(new_normal).await.unwrap();

    let mut high = plain_spec(None, TaskKind::PdfAnalysis);
    high.priority = 9;
    let high = tasks.create_task(high).await.unwrap();

    let order: Vec<i64> = [
        tasks.claim_next("w1", &[], 60).await.unwrap().unwrap().id,
        tasks.claim_next("w1", &[], 60).await.unwrap().unwrap().id,
        tasks.claim_next("w1", &[], 60).await.unwrap().unwrap().id,
        tasks.claim_next("w1", &[], 60).await.unwrap().unwrap().id,
    ]
    .to_vec();
    assert_eq!(order, vec![high.id, old_normal.id, new_normal.id, low.id]);
}

/// Progress over 100 is a validation error; 100 itself is reserved for
/// completion and clamped on reports.
#[tokio::test]
async fn progress_bounds_are_enforced() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let task = tasks
        .create_task(plain_spec(None, TaskKind::PdfAnalysis))
        .await
        .unwrap();
    tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();

    let err = tasks
        .report_progress(task.id, "w1", 101, None, None, None, 60)
        .await;
    assert!(matches!(err, Err(AppError::InvalidInput(_))));

    let clamped = tasks
        .report_progress(task.id, "w1", 100, None, None, None, 60)
        .await
        .expect("progress 100 is accepted but clamped");
    assert_eq!(clamped.progress, 99);
    assert_eq!(clamped.state, TaskState::Processing);
}

/// A `completion`-mode dependent becomes runnable on any terminal upstream
/// outcome, including cancellation.
#[tokio::test]
async fn completion_mode_dependents_survive_upstream_failure() {
    let app = setup_test_app().await;
    let tasks = &app.state.tasks;

    let upstream = tasks
        .create_task(plain_spec(None, TaskKind::PdfAnalysis))
        .await
        .unwrap();
    let mut dependent_spec = plain_spec(None, TaskKind::TemplateProcessing);
    dependent_spec.dependencies = vec![DependencySpec {
        depends_on_id: upstream.id,
        mode: DependencyMode::Completion,
    }];
    let dependent = tasks.create_task(dependent_spec).await.unwrap();

    // Blocked while the upstream is live.
    let claimed = tasks.claim_next("w1", &[], 60).await.unwrap().unwrap();
    assert_eq!(claimed.id, upstream.id);
    assert!(tasks.claim_next("w2", &[], 60).await.unwrap().is_none());
    tasks.release(upstream.id, "w1").await.unwrap();

    // Upstream cancelled: completion-mode dependent is now runnable.
    tasks.cancel_task(upstream.id).await.unwrap();
    let claimed = tasks.claim_next("w2", &[], 60).await.unwrap().unwrap();
    assert_eq!(claimed.id, dependent.id);
}
