//! Error types for upstream calls and configuration

use thiserror::Error;

/// Gateway-wide error type
#[derive(Error, Debug)]
pub enum DeribitError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Snapshot unavailable for {0}")]
    Unavailable(String),
}

impl DeribitError {
    pub fn api(msg: impl Into<String>) -> Self {
        DeribitError::Api(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        DeribitError::Network(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        DeribitError::Auth(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        DeribitError::Parse(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DeribitError::NotFound(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        DeribitError::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DeribitError::Config(msg.into())
    }

    pub fn unavailable(symbol: impl Into<String>) -> Self {
        DeribitError::Unavailable(symbol.into())
    }
}

/// Result type alias for gateway operations
pub type DeribitResult<T> = Result<T, DeribitError>;
