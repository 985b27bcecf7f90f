//! Deribit Order Gateway
//!
//! Authenticates against Deribit, serves symbol-filtered order-book
//! snapshots to WebSocket subscribers and logs the account's positions.

use std::sync::Arc;

use anyhow::Context;
use deribit_client::{DeribitClient, OrderManager};
use deribit_core::{AppConfig, SnapshotSource};
use deribit_stream::{start, FeedConfig, OrderBookFeed, ServerConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,deribit_gateway=debug,deribit_stream=debug")
            }),
        )
        .init();

    info!("Starting Deribit Order Gateway");

    let config_path =
        std::env::var("DERIBIT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    info!("Using Deribit API at {}", config.api_url);

    let client = Arc::new(DeribitClient::from_config(&config)?);
    client
        .authenticate()
        .await
        .context("Failed to authenticate with Deribit")?;

    let server = start(ServerConfig::from_settings(&config.server))
        .await
        .context("Failed to start the stream server")?;
    info!("Stream server listening on ws://{}", server.local_addr());

    let source: Arc<dyn SnapshotSource> = client.clone();
    let feed = OrderBookFeed::new(
        source,
        server.broadcaster(),
        FeedConfig::from_settings(&config.feed),
    )
    .spawn();

    let orders = OrderManager::new(client.clone());
    match orders
        .get_position(&config.positions_currency, config.positions_kind)
        .await
    {
        Ok(positions) if positions.is_empty() => {
            info!("No open {} positions", config.positions_currency)
        }
        Ok(positions) => {
            for position in positions {
                info!(
                    "Position {}: size {} ({})",
                    position.instrument_name,
                    position.size,
                    position.direction.as_deref().unwrap_or("zero")
                );
            }
        }
        Err(e) => warn!("Failed to fetch positions: {}", e),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    feed.stop();
    server.stop();
    feed.join().await;

    if let Err(e) = server.join().await {
        error!("Stream server exited with error: {}", e);
        return Err(e.into());
    }

    info!("Deribit Order Gateway stopped");
    Ok(())
}
