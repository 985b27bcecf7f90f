//! Core types for the Deribit order gateway
//!
//! This crate defines the shared data structures used across the gateway:
//! the control-message protocol spoken by stream subscribers, connection
//! lifecycle states, order enums, configuration and the error taxonomy for
//! upstream calls.

pub mod config;
pub mod error;
pub mod feed;
pub mod order;
pub mod websocket;

pub use config::{AppConfig, FeedSettings, ServerSettings};
pub use error::{DeribitError, DeribitResult};
pub use feed::SnapshotSource;
pub use order::{InstrumentKind, OrderSide};
pub use websocket::{ConnectionState, ControlMessage};
