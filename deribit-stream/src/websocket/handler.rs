//! Control-message processing
//!
//! Applies one connection's subscribe/unsubscribe requests to the registry.
//! Malformed input is logged and dropped; it never closes the connection.

use std::sync::Arc;

use deribit_core::ControlMessage;
use tracing::{debug, warn};

use super::connection::ConnectionId;
use super::registry::SubscriptionRegistry;
use crate::StreamError;

/// Registry change produced by a valid control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// `added` is false when the connection was already subscribed
    Subscribed { symbol: String, added: bool },
    /// `removed` is false when the connection was not subscribed
    Unsubscribed { symbol: String, removed: bool },
}

/// Applies control messages for any connection against a shared registry
#[derive(Debug, Clone)]
pub struct ControlProcessor {
    registry: Arc<SubscriptionRegistry>,
}

impl ControlProcessor {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Parse a raw text frame and apply it
    pub fn process(&self, id: ConnectionId, raw: &str) -> Result<ControlOutcome, StreamError> {
        let message = ControlMessage::parse(raw).map_err(StreamError::malformed)?;

        match message {
            ControlMessage::Subscribe { symbol } => {
                let added = self.registry.add_subscription(id, &symbol)?;
                debug!("{} subscribed to {}", id, symbol);
                Ok(ControlOutcome::Subscribed { symbol, added })
            }
            ControlMessage::Unsubscribe { symbol } => {
                let removed = self.registry.remove_subscription(id, &symbol);
                debug!("{} unsubscribed from {}", id, symbol);
                Ok(ControlOutcome::Unsubscribed { symbol, removed })
            }
        }
    }

    /// Handle an inbound text frame, logging anything that could not be applied
    pub fn handle_text(&self, id: ConnectionId, raw: &str) {
        if let Err(e) = self.process(id, raw) {
            warn!("Ignoring message from {}: {}", id, e);
        }
    }

    /// Binary frames carry no control messages
    pub fn handle_binary(&self, id: ConnectionId, len: usize) {
        warn!(
            "Ignoring message from {}: {}",
            id,
            StreamError::malformed(format!("unexpected binary frame ({} bytes)", len))
        );
    }
}
