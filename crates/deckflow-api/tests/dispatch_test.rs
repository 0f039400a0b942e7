//! Dispatcher scenarios: the deck analysis chain, dependency gating, and
//! cascade of `success_only` dependents when the upstream dies.

mod helpers;

use axum::http::StatusCode;
use helpers::{api_path, create_test_deck, register_test_worker, setup_test_app_with, test_queue_config};
use serde_json::json;

use deckflow_core::models::{TaskErrorKind, TaskState};

/// The standard chain: visual analysis first, template processing gated on
/// its success, deck pointer at the head.
#[tokio::test]
async fn analyze_deck_schedules_the_chain() {
    let app = setup_test_app_with(test_queue_config()).await;
    let deck_id = create_test_deck(&app, "chain-co").await;
    register_test_worker(&app, "w1").await;

    let response = app
        .client()
        .post(&api_path(&format!("/decks/{}/analyze", deck_id)))
        .json(&json!({}))
        .await;
    response.assert_status(StatusCode::CREATED);
    let chain: serde_json::Value = response.json();
    let head_id = chain["head_task_id"].as_i64().unwrap();
    let task_ids = chain["task_ids"].as_array().unwrap();
    assert_eq!(task_ids.len(), 2);
    assert_eq!(task_ids[0].as_i64(), Some(head_id));

    let response = app
        .client()
        .get(&api_path(&format!("/decks/{}", deck_id)))
        .await;
    let deck: serde_json::Value = response.json();
    assert_eq!(deck["current_processing_task_id"].as_i64(), Some(head_id));

    // Only the head is runnable; the dependent waits.
    let response = app
        .client()
        .post(&api_path("/workers/w1/claim"))
        .json(&json!({"capabilities": []}))
        .await;
    response.assert_status_ok();
    let claimed: serde_json::Value = response.json();
    assert_eq!(claimed["id"].as_i64(), Some(head_id));
    assert_eq!(claimed["task_kind"], "visual_analysis");

    let response = app
        .client()
        .post(&api_path("/workers/w2/claim"))
        .json(&json!({"capabilities": []}))
        .await;
    response.assert_status(StatusCode::NO_CONTENT);

    // Head succeeds: the dependent becomes runnable.
    let response = app
        .client()
        .post(&api_path(&format!("/tasks/{}/complete", head_id)))
        .json(&json!({
            "worker_id": "w1",
            "outcome": "success",
            "result_path": "/shared/results/chain-co-visual.json"
        }))
        .await;
    response.assert_status_ok();

    let response = app
        .client()
        .post(&api_path("/workers/w2/claim"))
        .json(&json!({"capabilities": []}))
        .await;
    response.assert_status_ok();
    let dependent: serde_json::Value = response.json();
    assert_eq!(dependent["task_kind"], "template_processing");
    assert_eq!(dependent["id"].as_i64(), task_ids[1].as_i64());
}

/// A `success_only` dependent is never handed out while the upstream is
/// live, and dies with it when the upstream fails terminally.
#[tokio::test]
async fn success_only_dependent_dies_with_its_upstream() {
    // One attempt only, so the first failure is terminal.
    let mut queue = test_queue_config();
    queue.max_attempts = 1;
    let app = setup_test_app_with(queue).await;
    let deck_id = create_test_deck(&app, "doomed-co").await;
    register_test_worker(&app, "w1").await;

    let response = app
        .client()
        .post(&api_path(&format!("/decks/{}/analyze", deck_id)))
        .json(&json!({}))
        .await;
    response.assert_status(StatusCode::CREATED);
    let chain: serde_json::Value = response.json();
    let head_id = chain["head_task_id"].as_i64().unwrap();
    let dependent_id = chain["task_ids"][1].as_i64().unwrap();

    // A poll before the head completes returns the head, never the
    // dependent.
    let response = app
        .client()
        .post(&api_path("/workers/w1/claim"))
        .json(&json!({"capabilities": []}))
        .await;
    response.assert_status_ok();
    let claimed: serde_json::Value = response.json();
    assert_eq!(claimed["id"].as_i64(), Some(head_id));

    // Terminal failure of the head.
    let response = app
        .client()
        .post(&api_path(&format!("/tasks/{}/complete", head_id)))
        .json(&json!({
            "worker_id": "w1",
            "outcome": "failure",
            "error": "vision model rejected the deck"
        }))
        .await;
    response.assert_status_ok();
    let failed: serde_json::Value = response.json();
    assert_eq!(failed["state"], "failed");

    // Neither task is runnable any more.
    let response = app
        .client()
        .post(&api_path("/workers/w1/claim"))
        .json(&json!({"capabilities": []}))
        .await;
    response.assert_status(StatusCode::NO_CONTENT);

    let dependent = app
        .state
        .tasks
        .get_task(dependent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dependent.state, TaskState::Failed);
    assert_eq!(dependent.error_code, Some(TaskErrorKind::DependencyFailed));
    let error = dependent.last_error.expect("dependency error recorded");
    assert!(
        error.starts_with("dependency cancelled"),
        "unexpected error: {}",
        error
    );

    let deck = app.state.decks.get_deck(deck_id).await.unwrap().unwrap();
    assert_eq!(
        serde_json::to_value(deck.processing_status).unwrap(),
        json!("failed")
    );
}

/// Cancelling an upstream cascades its `success_only` dependents, including
/// transitively.
#[tokio::test]
async fn cancel_cascades_through_dependency_chains() {
    let app = setup_test_app_with(test_queue_config()).await;
    let deck_id = create_test_deck(&app, "cascade-co").await;

    let response = app
        .client()
        .post(&api_path(&format!("/decks/{}/analyze", deck_id)))
        .json(&json!({}))
        .await;
    let chain: serde_json::Value = response.json();
    let head_id = chain["head_task_id"].as_i64().unwrap();
    let dependent_id = chain["task_ids"][1].as_i64().unwrap();

    // Third task hanging off the template step.
    let response = app
        .client()
        .post(&api_path("/tasks"))
        .json(&json!({
            "deck_id": deck_id,
            "task_kind": "pdf_analysis",
            "file_path": "/shared/decks/cascade-co.pdf",
            "company_id": "cascade-co",
            "dependencies": [{"depends_on_id": dependent_id, "mode": "success_only"}]
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let tail: serde_json::Value = response.json();
    let tail_id = tail["id"].as_i64().unwrap();

    let response = app
        .client()
        .post(&api_path(&format!("/tasks/{}/cancel", head_id)))
        .await;
    response.assert_status_ok();

    let head = app.state.tasks.get_task(head_id).await.unwrap().unwrap();
    assert_eq!(head.state, TaskState::Failed);
    assert_eq!(head.error_code, Some(TaskErrorKind::Cancelled));

    // The cascade marks both transitive dependents as dependency failures.
    for id in [dependent_id, tail_id] {
        let task = app.state.tasks.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed, "task {} should be failed", id);
        assert_eq!(task.error_code, Some(TaskErrorKind::DependencyFailed));
    }
}

/// Dependencies must reference existing tasks; unknown ids are a validation
/// error, not a 500.
#[tokio::test]
async fn unknown_dependency_is_rejected() {
    let app = setup_test_app_with(test_queue_config()).await;

    let response = app
        .client()
        .post(&api_path("/tasks"))
        .json(&json!({
            "task_kind": "pdf_analysis",
            "file_path": "/shared/decks/x.pdf",
            "company_id": "x-co",
            "dependencies": [{"depends_on_id": 999999}]
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let error: serde_json::Value = response.json();
    assert_eq!(error["code"], "invalid_input");
}

/// Malformed enqueue payloads are validation errors.
#[tokio::test]
async fn enqueue_validates_kind_and_options() {
    let app = setup_test_app_with(test_queue_config()).await;

    let response = app
        .client()
        .post(&api_path("/tasks"))
        .json(&json!({
            "task_kind": "frame_interpolation",
            "file_path": "/shared/decks/x.pdf",
            "company_id": "x-co"
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = app
        .client()
        .post(&api_path("/tasks"))
        .json(&json!({
            "task_kind": "visual_analysis",
            "file_path": "/shared/decks/x.pdf",
            "company_id": "x-co",
            "options": {"page_limit": "twenty"}
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let error: serde_json::Value = response.json();
    assert_eq!(error["code"], "invalid_input");
}

/// Enqueue-then-get round trip: the stored task carries the same inputs and
/// starts queued. Deck task listing is newest first.
#[tokio::test]
async fn enqueue_round_trip_and_deck_listing() {
    let app = setup_test_app_with(test_queue_config()).await;
    let deck_id = create_test_deck(&app, "list-co").await;

    let response = app
        .client()
        .post(&api_path("/tasks"))
        .json(&json!({
            "deck_id": deck_id,
            "task_kind": "pdf_analysis",
            "file_path": "/shared/decks/list-co.pdf",
            "company_id": "list-co",
            "options": {"language": "de"},
            "priority": 7
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created: serde_json::Value = response.json();
    let first_id = created["id"].as_i64().unwrap();

    let response = app
        .client()
        .get(&api_path(&format!("/tasks/{}", first_id)))
        .await;
    response.assert_status_ok();
    let fetched: serde_json::Value = response.json();
    assert_eq!(fetched["state"], "queued");
    assert_eq!(fetched["file_path"], "/shared/decks/list-co.pdf");
    assert_eq!(fetched["company_id"], "list-co");
    assert_eq!(fetched["options"]["language"], "de");
    assert_eq!(fetched["priority"], 7);

    let response = app
        .client()
        .post(&api_path("/tasks"))
        .json(&json!({
            "deck_id": deck_id,
            "task_kind": "visual_analysis",
            "file_path": "/shared/decks/list-co.pdf",
            "company_id": "list-co"
        }))
        .await;
    let second: serde_json::Value = response.json();
    let second_id = second["id"].as_i64().unwrap();

    let response = app
        .client()
        .get(&api_path(&format!("/decks/{}/tasks", deck_id)))
        .await;
    response.assert_status_ok();
    let listing: serde_json::Value = response.json();
    assert_eq!(listing["count"], 2);
    assert_eq!(listing["tasks"][0]["id"].as_i64(), Some(second_id));
    assert_eq!(listing["tasks"][1]["id"].as_i64(), Some(first_id));
}
