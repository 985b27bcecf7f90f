//! Deribit integration for the order gateway
//!
//! This crate provides the JSON-RPC client for the Deribit API and the
//! order manager that tracks orders placed through it. The client also
//! serves order-book snapshots to the stream feed.

pub mod client;
pub mod order_manager;
pub mod types;

pub use client::DeribitClient;
pub use order_manager::{OrderGateway, OrderManager, UNKNOWN_ORDER_ID};
pub use types::{AuthResult, Order, OrderResponse, Position, RpcError, RpcResponse};
