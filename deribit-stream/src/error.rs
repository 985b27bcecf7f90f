//! Error types for the broadcast engine

use std::net::SocketAddr;

use thiserror::Error;

use crate::websocket::ConnectionId;

/// Registry contract violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    AlreadyRegistered(ConnectionId),

    #[error("{0} is not registered")]
    NotRegistered(ConnectionId),
}

/// Why a single recipient did not get a broadcast payload
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The connection is no longer open or its queue was dropped
    #[error("connection closed")]
    Closed,

    /// The outbound queue stayed full for longer than the send timeout
    #[error("send timed out")]
    TimedOut,
}

/// Errors surfaced by the stream server and connection lifecycle
#[derive(Error, Debug)]
pub enum StreamError {
    /// Listening endpoint could not be bound; the server cannot start
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Listener failed in a way the accept loop cannot recover from
    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: SocketAddr, reason: String },

    #[error("Handshake with {peer} timed out")]
    HandshakeTimeout { peer: SocketAddr },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl StreamError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        StreamError::MalformedMessage(reason.into())
    }
}
