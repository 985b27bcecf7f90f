//! Gateway configuration
//!
//! Loaded from a JSON file (the same `client_id`/`client_secret` document
//! the gateway has always used) with optional sections for the stream
//! server and the order-book feed, then overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{DeribitError, DeribitResult, InstrumentKind};

/// Default Deribit API endpoint (testnet)
pub const DEFAULT_API_URL: &str = "https://test.deribit.com/api/v2";

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API client id
    #[serde(default)]
    pub client_id: String,
    /// API client secret
    #[serde(default)]
    pub client_secret: String,
    /// Base URL of the JSON-RPC API
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Subscription stream server
    #[serde(default)]
    pub server: ServerSettings,
    /// Periodic order-book feed
    #[serde(default)]
    pub feed: FeedSettings,
    /// Currency whose positions are logged at startup
    #[serde(default = "default_positions_currency")]
    pub positions_currency: String,
    /// Instrument kind for the startup position query
    #[serde(default)]
    pub positions_kind: InstrumentKind,
}

/// Settings for the subscription stream server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Capacity of each connection's outbound queue
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// How long a broadcast may wait on one subscriber's full queue
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How long a single socket write may take
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// Settings for the order-book feed driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Symbols the feed is allowed to poll
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Optional order-book depth passed upstream
    #[serde(default)]
    pub depth: Option<u32>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            outbound_queue: default_outbound_queue(),
            send_timeout_ms: default_send_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ServerSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            symbols: default_symbols(),
            depth: None,
        }
    }
}

impl FeedSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_url: default_api_url(),
            server: ServerSettings::default(),
            feed: FeedSettings::default(),
            positions_currency: default_positions_currency(),
            positions_kind: InstrumentKind::default(),
        }
    }
}

impl AppConfig {
    /// Parse configuration from a JSON document
    pub fn from_json(json: &str) -> DeribitResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| DeribitError::config(format!("Invalid configuration JSON: {}", e)))
    }

    /// Read configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> DeribitResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DeribitError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    /// Load configuration for the running process
    ///
    /// The file is optional: when it does not exist the defaults are used and
    /// credentials must come from the environment. Environment variables
    /// always win over file values.
    pub fn load(path: impl AsRef<Path>) -> DeribitResult<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment)
    ///
    /// Recognised keys:
    /// - DERIBIT_CLIENT_ID, DERIBIT_CLIENT_SECRET, DERIBIT_API_URL
    /// - SERVER_HOST, SERVER_PORT
    pub fn apply_overrides<F>(&mut self, lookup: F) -> DeribitResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("DERIBIT_CLIENT_ID") {
            self.client_id = id;
        }
        if let Some(secret) = lookup("DERIBIT_CLIENT_SECRET") {
            self.client_secret = secret;
        }
        if let Some(url) = lookup("DERIBIT_API_URL") {
            self.api_url = url;
        }
        if let Some(host) = lookup("SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| DeribitError::config(format!("SERVER_PORT is not a port: {}", port)))?;
        }
        Ok(())
    }

    /// Check that the configuration can start a gateway
    pub fn validate(&self) -> DeribitResult<()> {
        if self.client_id.trim().is_empty() {
            return Err(DeribitError::config("client_id is required"));
        }
        if self.client_secret.trim().is_empty() {
            return Err(DeribitError::config("client_secret is required"));
        }
        if self.feed.interval_ms == 0 {
            return Err(DeribitError::config("feed.interval_ms must be greater than zero"));
        }
        if self.server.outbound_queue == 0 {
            return Err(DeribitError::config("server.outbound_queue must be greater than zero"));
        }
        Ok(())
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_outbound_queue() -> usize {
    256
}

fn default_send_timeout_ms() -> u64 {
    2_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_symbols() -> Vec<String> {
    vec!["BTC-PERPETUAL".to_string()]
}

fn default_positions_currency() -> String {
    "BTC".to_string()
}
