//! Periodic order-book feed
//!
//! Polls a [`SnapshotSource`] for every configured symbol that currently has
//! subscribers and broadcasts each snapshot verbatim. Upstream failures are
//! logged and skipped; the feed only stops when told to.

use std::sync::Arc;
use std::time::Duration;

use deribit_core::{FeedSettings, SnapshotSource};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::websocket::Broadcaster;

/// Feed driver configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub interval: Duration,
    /// Symbols the feed may poll
    pub symbols: Vec<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            symbols: vec!["BTC-PERPETUAL".to_string()],
        }
    }
}

impl FeedConfig {
    pub fn from_settings(settings: &FeedSettings) -> Self {
        Self {
            interval: settings.interval(),
            symbols: settings.symbols.clone(),
        }
    }
}

fn is_empty_snapshot(snapshot: &Value) -> bool {
    match snapshot {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Drives snapshots from an upstream source into a [`Broadcaster`]
pub struct OrderBookFeed {
    source: Arc<dyn SnapshotSource>,
    broadcaster: Broadcaster,
    config: FeedConfig,
}

impl OrderBookFeed {
    pub fn new(source: Arc<dyn SnapshotSource>, broadcaster: Broadcaster, config: FeedConfig) -> Self {
        Self {
            source,
            broadcaster,
            config,
        }
    }

    /// Configured symbols that currently have at least one subscriber
    fn watched_symbols(&self) -> Vec<&str> {
        let registry = self.broadcaster.registry();
        self.config
            .symbols
            .iter()
            .map(String::as_str)
            .filter(|symbol| registry.has_subscribers(symbol))
            .collect()
    }

    /// Fetch and broadcast one round of snapshots
    ///
    /// Returns the number of symbols whose snapshot was broadcast.
    pub async fn poll_once(&self) -> usize {
        let mut broadcast = 0;

        for symbol in self.watched_symbols() {
            let snapshot = match self.source.fetch_snapshot(symbol).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Skipping {} this tick: {}", symbol, e);
                    continue;
                }
            };

            if is_empty_snapshot(&snapshot) {
                debug!("Empty snapshot for {}, not broadcasting", symbol);
                continue;
            }

            self.broadcaster.broadcast_json(symbol, &snapshot).await;
            broadcast += 1;
        }

        broadcast
    }

    /// Poll every interval until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Order-book feed started: {:?} every {:?}",
            self.config.symbols, self.config.interval
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        info!("Order-book feed stopped");
    }

    /// Run the feed on its own task
    pub fn spawn(self) -> FeedHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(rx).await });
        FeedHandle { shutdown, task }
    }
}

/// Handle to a spawned [`OrderBookFeed`]
pub struct FeedHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    /// Ask the feed to stop after its current round. Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Order-book feed task failed: {}", e);
        }
    }
}
