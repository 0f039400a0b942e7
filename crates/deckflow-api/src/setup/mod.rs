pub mod database;
pub mod routes;
pub mod server;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;

use crate::maintenance::{spawn_maintenance, MaintenanceHandle};
use crate::state::AppState;
use deckflow_core::Config;

/// Initialize the application: database, state, routes, maintenance loops.
pub async fn initialize_app(
    config: Config,
) -> Result<(Arc<AppState>, Router, MaintenanceHandle)> {
    let pool = database::setup_database(&config).await?;
    let state = Arc::new(AppState::new(pool, config.clone()));

    let maintenance = spawn_maintenance(
        state.tasks.clone(),
        state.workers.clone(),
        config.queue.clone(),
    );

    let router = routes::setup_routes(&config, state.clone())?;
    Ok((state, router, maintenance))
}
