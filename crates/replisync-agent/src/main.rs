//! replisync agent: replicates one SQLite-backed collection until stopped.

use anyhow::{Context, Result};
use replisync_agent::{AgentConfig, Replica, ReplicationEvent, SqliteStore, Status};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting replisync agent"
    );

    // Load configuration
    let config = AgentConfig::from_env()?;

    let store = SqliteStore::open(&config.db_path, config.collection.clone())
        .with_context(|| format!("Failed to open store at {}", config.db_path.display()))?;

    let replica = Replica::builder()
        .with_config(config.replica)
        .store(Arc::new(store))
        .create()
        .context("Failed to create replica")?;

    tracing::info!(
        replica_id = %replica.replica_id(),
        collection = %config.collection,
        last_sync_time = replica.last_sync_time(),
        "Replica initialized"
    );

    let mut events = replica.subscribe();
    let status = replica.connect().await;
    if status == Status::Disconnected {
        tracing::warn!("Remote not reachable, waiting for Ctrl+C");
    }

    tracing::info!("Agent running, press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ReplicationEvent::Error { message, fatal: true }) => {
                    tracing::error!(error = %message, "Replication stopped");
                    break;
                }
                Ok(event) => tracing::debug!(?event, "Replication event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event receiver lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    replica.close();
    tracing::info!("Agent stopped");

    Ok(())
}
