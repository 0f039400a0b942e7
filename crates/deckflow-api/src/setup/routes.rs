//! Route configuration and setup

use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::constants::API_PREFIX;
use crate::handlers;
use crate::state::AppState;
use deckflow_core::Config;

/// Setup all application routes
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Result<Router, anyhow::Error> {
    let cors = setup_cors(config)?;

    // Server-level concurrency limit to protect the pool under extreme load
    let http_concurrency_limit = std::env::var("HTTP_CONCURRENCY_LIMIT")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000)
        .max(1);

    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .merge(task_routes())
        .merge(deck_routes())
        .merge(worker_routes())
        .layer(ConcurrencyLimitLayer::new(http_concurrency_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}

/// Dispatcher-side task routes
fn task_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            &format!("{}/tasks", API_PREFIX),
            post(handlers::tasks::create_task).get(handlers::tasks::list_tasks),
        )
        .route(
            &format!("{}/tasks/stats", API_PREFIX),
            get(handlers::tasks::get_task_stats),
        )
        .route(
            &format!("{}/tasks/{{id}}", API_PREFIX),
            get(handlers::tasks::get_task),
        )
        .route(
            &format!("{}/tasks/{{id}}/cancel", API_PREFIX),
            post(handlers::tasks::cancel_task),
        )
        .route(
            &format!("{}/tasks/{{id}}/progress", API_PREFIX),
            get(handlers::tasks::get_task_progress).post(handlers::workers::report_progress),
        )
        .route(
            &format!("{}/tasks/{{id}}/complete", API_PREFIX),
            post(handlers::workers::complete_task),
        )
        .route(
            &format!("{}/tasks/{{id}}/release", API_PREFIX),
            post(handlers::workers::release_task),
        )
}

/// Deck routes
fn deck_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            &format!("{}/decks/{{id}}/analyze", API_PREFIX),
            post(handlers::decks::analyze_deck),
        )
        .route(
            &format!("{}/decks/{{id}}", API_PREFIX),
            get(handlers::decks::get_deck),
        )
        .route(
            &format!("{}/decks/{{id}}/tasks", API_PREFIX),
            get(handlers::decks::list_deck_tasks),
        )
}

/// Worker-facing routes
fn worker_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            &format!("{}/workers/register", API_PREFIX),
            post(handlers::workers::register_worker),
        )
        .route(
            &format!("{}/workers", API_PREFIX),
            get(handlers::workers::list_workers),
        )
        .route(
            &format!("{}/workers/{{id}}/heartbeat", API_PREFIX),
            post(handlers::workers::worker_heartbeat),
        )
        .route(
            &format!("{}/workers/{{id}}/claim", API_PREFIX),
            post(handlers::workers::claim_task),
        )
}

/// Setup CORS configuration
fn setup_cors(config: &Config) -> Result<CorsLayer, anyhow::Error> {
    let cors = if config.base.cors_origins.contains(&"*".to_string()) {
        if config.is_production() {
            tracing::warn!("CORS configured to allow all origins in production");
        }
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .base
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    };
    Ok(cors)
}
