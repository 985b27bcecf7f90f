//! WebSocket infrastructure for symbol-filtered streaming
//!
//! Connections are accepted and driven by [`ConnectionManager`], their
//! control messages applied by [`ControlProcessor`], and payloads fanned
//! out by [`Broadcaster`] against snapshots of the [`SubscriptionRegistry`].

mod broadcaster;
mod connection;
mod handler;
mod registry;

pub use broadcaster::{BroadcastReport, Broadcaster};
pub use connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionId, ConnectionManager,
    ConnectionSettings,
};
pub use handler::{ControlOutcome, ControlProcessor};
pub use registry::SubscriptionRegistry;
