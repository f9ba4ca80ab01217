//! Arena Game Server
//!
//! Accepts WebSocket players, drafts them into six-player matches and
//! streams match state until each match ends.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

use arena::{GameServer, MemoryStore, ServerConfig, ROSTER_SIZE, TICK_RATE, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = ServerConfig::from_env();
    info!("Arena Server v{}", VERSION);
    info!(
        "Roster size: {}, tick rate: {} Hz (default {} Hz)",
        ROSTER_SIZE, config.session.tick_rate, TICK_RATE
    );

    let server = Arc::new(GameServer::new(config, Arc::new(MemoryStore::new())));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        signal_server.shutdown();
    });

    server.run().await.context("server failed")?;
    info!("Goodbye");
    Ok(())
}
