mod constants;
mod error;
mod handlers;
mod maintenance;
mod services;
mod setup;
mod state;

use deckflow_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize the application (database, state, routes, maintenance)
    let (_state, router, maintenance) = setup::initialize_app(config.clone()).await?;

    // Start the server; returns once the shutdown signal has been handled
    setup::server::start_server(&config, router).await?;

    maintenance.shutdown().await;

    Ok(())
}
