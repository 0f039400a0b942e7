mod analyzer;
mod runner;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use analyzer::HttpAnalyzer;
use deckflow_api_client::ApiClient;
use deckflow_core::WorkerConfig;
use runner::WorkerRunner;

/// Default worker identity: `<hostname>-<pid>`.
fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env(default_worker_id())?;
    tracing::info!(
        worker_id = %config.worker_id,
        api_url = %config.api_url,
        processor_url = %config.processor_url,
        "Worker starting"
    );

    let client = ApiClient::new(config.api_url.clone(), config.api_key.clone())?;
    let analyzer = Arc::new(HttpAnalyzer::new(&config)?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    WorkerRunner::new(client, analyzer, config, shutdown)
        .run()
        .await
}

/// Listens for Ctrl+C (SIGINT) and SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
