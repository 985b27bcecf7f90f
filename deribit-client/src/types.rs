//! Deribit JSON-RPC response types

use deribit_core::{DeribitError, DeribitResult, InstrumentKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 envelope returned by every endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse<T> {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default = "Option::default")]
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<RpcError>,
    /// Server-side processing time in microseconds
    #[serde(default, rename = "usDiff")]
    pub us_diff: Option<u64>,
}

impl<T> RpcResponse<T> {
    /// Unwrap the `result`, turning an `error` object into [`DeribitError::Api`]
    pub fn into_result(self, method: &str) -> DeribitResult<T> {
        if let Some(error) = self.error {
            return Err(DeribitError::api(format!("{} failed: {}", method, error)));
        }

        self.result
            .ok_or_else(|| DeribitError::parse(format!("{} returned no result", method)))
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Result of `public/auth`
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Result of `private/buy`, `private/sell` and `private/edit`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderResponse {
    #[serde(default)]
    pub order: Option<Order>,
    #[serde(default)]
    pub trades: Vec<serde_json::Value>,
}

impl OrderResponse {
    pub fn order_id(&self) -> Option<&str> {
        self.order.as_ref().map(|order| order.order_id.as_str())
    }
}

/// An order as reported by Deribit
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Order {
    pub order_id: String,
    #[serde(default)]
    pub instrument_name: Option<String>,
    #[serde(default)]
    pub order_state: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub filled_amount: Option<Decimal>,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub average_price: Option<Decimal>,
}

/// An open position from `private/get_positions`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Position {
    pub instrument_name: String,
    #[serde(default)]
    pub kind: Option<InstrumentKind>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub average_price: Option<Decimal>,
    #[serde(default)]
    pub mark_price: Option<Decimal>,
    #[serde(default)]
    pub floating_profit_loss: Option<Decimal>,
    #[serde(default)]
    pub total_profit_loss: Option<Decimal>,
}
