//! Refresh worker service entry point
//!
//! Startup order: configuration, logging, store + schema, recovery of
//! active watchers, then the orchestrator loop until Ctrl+C.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use refresh_worker::api::NodeApiClient;
use refresh_worker::config::Config;
use refresh_worker::db::Store;
use refresh_worker::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = Config::load_with_env(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting wallet refresh worker");
    info!(api_url = %config.api.url, "Node API configured");

    let store = Store::connect(&config.database).await?;
    store.init_schema().await?;
    info!("Database schema ready");

    let api = Arc::new(NodeApiClient::new(&config.api));

    if config.orchestrator.enable_recovery {
        match store.recover(config.refresh.max_retries).await {
            Ok(recovered) => info!(recovered, "Recovered active watchers"),
            Err(e) => error!(error = %e, "Failed to recover active watchers"),
        }
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let config = Arc::new(config);

    let orchestrator = Orchestrator::new(store, api, config, shutdown_tx.clone());
    let orchestrator_handle = tokio::spawn(orchestrator.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = orchestrator_handle.await;

    info!("Refresh worker stopped");
    Ok(())
}
