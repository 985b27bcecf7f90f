//! WebSocket protocol types for the subscription stream
//!
//! Subscribers send [`ControlMessage`]s; the server only ever sends
//! payloads verbatim, so there is no server-side message enum.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Control messages sent from a subscriber to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Start receiving updates for a symbol
    Subscribe { symbol: String },
    /// Stop receiving updates for a symbol
    Unsubscribe { symbol: String },
}

impl ControlMessage {
    /// Parse and validate a raw text frame.
    ///
    /// Unknown fields are ignored; an unknown `type`, a missing field or a
    /// blank symbol is rejected with a human-readable reason.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let message: ControlMessage =
            serde_json::from_str(raw).map_err(|e| format!("Invalid control message: {}", e))?;

        if message.symbol().trim().is_empty() {
            return Err("Symbol must be a non-empty string".to_string());
        }

        Ok(message)
    }

    /// Get the symbol this message refers to
    pub fn symbol(&self) -> &str {
        match self {
            Self::Subscribe { symbol } => symbol,
            Self::Unsubscribe { symbol } => symbol,
        }
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

/// Lifecycle state of a subscriber connection
///
/// `Connecting -> Open -> Closing -> Closed`; `Closed` is terminal and a
/// connection that fails its handshake never leaves `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    /// TCP accepted, protocol handshake in progress
    Connecting = 0,
    /// Handshake complete, registered for deliveries
    Open = 1,
    /// Shutdown initiated locally, remotely or by a fault
    Closing = 2,
    /// Resources released and deregistered
    Closed = 3,
}

impl ConnectionState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
