//! Symbol-filtered fan-out
//!
//! A broadcast takes a snapshot of the symbol's subscribers, releases the
//! registry lock and then enqueues the payload for every recipient
//! concurrently. Each recipient fails on its own; nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, warn};

use super::registry::SubscriptionRegistry;
use crate::DeliveryFailure;

/// Outcome of a single broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub symbol: String,
    /// Subscribers in the snapshot
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers payloads to the connections subscribed to a symbol
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Deliver `payload` verbatim to every current subscriber of `symbol`
    ///
    /// A recipient whose queue stays full past the send timeout is faulted
    /// and left for its connection loop to tear down; the registry is never
    /// mutated from here.
    pub async fn broadcast(&self, symbol: &str, payload: impl Into<Utf8Bytes>) -> BroadcastReport {
        let recipients = self.registry.subscribers_of(symbol);
        let mut report = BroadcastReport {
            symbol: symbol.to_string(),
            attempted: recipients.len(),
            ..Default::default()
        };

        if recipients.is_empty() {
            return report;
        }

        let payload = payload.into();
        let deliveries = recipients.iter().map(|handle| {
            let payload = payload.clone();
            async move { (handle, handle.deliver(payload, self.send_timeout).await) }
        });

        for (handle, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    report.failed += 1;
                    warn!(
                        "Failed to deliver {} update to {}: {}",
                        symbol,
                        handle.id(),
                        failure
                    );
                    if failure == DeliveryFailure::TimedOut {
                        handle.fault("outbound queue full");
                    }
                }
            }
        }

        debug!(
            "Broadcast {} to {}/{} subscribers",
            symbol, report.delivered, report.attempted
        );
        report
    }

    /// Serialize once and broadcast the resulting text
    pub async fn broadcast_json(&self, symbol: &str, payload: &Value) -> BroadcastReport {
        self.broadcast(symbol, payload.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::ConnectionHandle;
    use deribit_core::ConnectionState;
    use serde_json::json;

    fn setup() -> (Arc<SubscriptionRegistry>, Broadcaster) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(50));
        (registry, broadcaster)
    }

    #[tokio::test]
    async fn test_delivers_only_to_subscribers() {
        let (registry, broadcaster) = setup();
        let (a, mut rx_a) = ConnectionHandle::detached(1, 8);
        let (b, mut rx_b) = ConnectionHandle::detached(2, 8);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        registry.add_subscription(a.id(), "BTC-PERPETUAL").unwrap();
        registry.add_subscription(b.id(), "ETH-PERPETUAL").unwrap();

        let report = broadcaster
            .broadcast_json("BTC-PERPETUAL", &json!({"bid": 100}))
            .await;

        assert_eq!(report.attempted, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(rx_a.try_recv().unwrap().as_str(), r#"{"bid":100}"#);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let (_registry, broadcaster) = setup();

        let report = broadcaster.broadcast("BTC-PERPETUAL", "{}").await;
        assert_eq!(
            report,
            BroadcastReport {
                symbol: "BTC-PERPETUAL".to_string(),
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_block_others() {
        let (registry, broadcaster) = setup();
        let (a, rx_a) = ConnectionHandle::detached(1, 8);
        let (b, mut rx_b) = ConnectionHandle::detached(2, 8);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        registry.add_subscription(a.id(), "BTC-PERPETUAL").unwrap();
        registry.add_subscription(b.id(), "BTC-PERPETUAL").unwrap();

        // a's receiving side is gone
        drop(rx_a);

        let report = broadcaster.broadcast("BTC-PERPETUAL", "tick").await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(rx_b.try_recv().unwrap().as_str(), "tick");

        // delivery failures never unregister
        assert!(registry.is_registered(a.id()));
    }

    #[tokio::test]
    async fn test_full_queue_faults_recipient() {
        let (registry, broadcaster) = setup();
        let (slow, _rx_slow) = ConnectionHandle::detached(1, 1);
        let (fast, mut rx_fast) = ConnectionHandle::detached(2, 8);
        registry.register(slow.clone()).unwrap();
        registry.register(fast.clone()).unwrap();
        registry.add_subscription(slow.id(), "BTC-PERPETUAL").unwrap();
        registry.add_subscription(fast.id(), "BTC-PERPETUAL").unwrap();

        let first = broadcaster.broadcast("BTC-PERPETUAL", "one").await;
        assert_eq!(first.delivered, 2);

        let second = broadcaster.broadcast("BTC-PERPETUAL", "two").await;
        assert_eq!(second.delivered, 1);
        assert_eq!(second.failed, 1);
        assert_eq!(slow.state(), ConnectionState::Closing);
        assert!(fast.is_open());

        assert_eq!(rx_fast.try_recv().unwrap().as_str(), "one");
        assert_eq!(rx_fast.try_recv().unwrap().as_str(), "two");
    }

    #[tokio::test]
    async fn test_same_symbol_order_preserved() {
        let (registry, broadcaster) = setup();
        let (a, mut rx_a) = ConnectionHandle::detached(1, 8);
        registry.register(a.clone()).unwrap();
        registry.add_subscription(a.id(), "BTC-PERPETUAL").unwrap();

        for n in 0..5 {
            broadcaster
                .broadcast_json("BTC-PERPETUAL", &json!({ "seq": n }))
                .await;
        }

        for n in 0..5 {
            assert_eq!(rx_a.try_recv().unwrap().as_str(), format!(r#"{{"seq":{}}}"#, n));
        }
    }
}
