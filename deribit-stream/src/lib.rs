//! Subscription broadcast engine for the Deribit order gateway
//!
//! Accepts persistent WebSocket subscribers, tracks which symbols each one
//! is interested in and fans out payloads only to interested connections.
//! The [`feed`] module drives periodic order-book snapshots into the
//! [`Broadcaster`].

pub mod error;
pub mod feed;
pub mod server;
pub mod websocket;

pub use error::{DeliveryFailure, RegistryError, StreamError};
pub use feed::{FeedConfig, FeedHandle, OrderBookFeed};
pub use server::{start, ServerConfig, ServerHandle, StreamServer};
pub use websocket::{
    BroadcastReport, Broadcaster, CloseReason, Connection, ConnectionHandle, ConnectionId,
    ConnectionManager, ConnectionSettings, ControlOutcome, ControlProcessor, SubscriptionRegistry,
};
