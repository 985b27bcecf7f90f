//! Deribit API client
//!
//! Thin JSON-RPC-over-HTTP client for the endpoints the gateway uses:
//! authentication, market orders, order edits and cancels, order books and
//! positions.

use std::time::Duration;

use async_trait::async_trait;
use deribit_core::{
    AppConfig, DeribitError, DeribitResult, InstrumentKind, OrderSide, SnapshotSource,
};
use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::types::{AuthResult, OrderResponse, Position, RpcResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deribit API client
pub struct DeribitClient {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    access_token: RwLock<Option<String>>,
    book_depth: Option<u32>,
}

impl DeribitClient {
    /// Create an unauthenticated client for `base_url`
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> DeribitResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DeribitError::network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            access_token: RwLock::new(None),
            book_depth: None,
        })
    }

    /// Create a client from the gateway configuration
    pub fn from_config(config: &AppConfig) -> DeribitResult<Self> {
        let mut client = Self::new(&config.api_url, &config.client_id, &config.client_secret)?;
        client.book_depth = config.feed.depth;
        Ok(client)
    }

    /// Order-book depth requested when serving snapshots
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.book_depth = Some(depth);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.read().is_some()
    }

    /// Authenticate with client credentials and keep the access token
    #[instrument(skip(self))]
    pub async fn authenticate(&self) -> DeribitResult<()> {
        info!("Authenticating with Deribit");

        let params = [
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("grant_type", "client_credentials".to_string()),
        ];

        let auth: AuthResult = self
            .call("public/auth", &params, false)
            .await
            .map_err(|e| match e {
                DeribitError::Api(msg) => DeribitError::auth(msg),
                other => other,
            })?;

        let token = auth
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| DeribitError::auth("access_token not found in auth response"))?;

        *self.access_token.write() = Some(token);
        info!(expires_in = ?auth.expires_in, "Authentication successful");
        Ok(())
    }

    /// Place a market order
    #[instrument(skip(self))]
    pub async fn place_order(
        &self,
        instrument: &str,
        amount: Decimal,
        side: OrderSide,
    ) -> DeribitResult<OrderResponse> {
        require_non_empty("Instrument name", instrument)?;
        require_positive("Amount", amount)?;

        let method = match side {
            OrderSide::Buy => "private/buy",
            OrderSide::Sell => "private/sell",
        };
        let params = [
            ("instrument_name", instrument.to_string()),
            ("amount", amount.to_string()),
            ("type", "market".to_string()),
        ];

        let response: OrderResponse = self.call(method, &params, true).await?;
        info!("Order placed: {}", response.order_id().unwrap_or("<no id>"));
        Ok(response)
    }

    /// Change the amount of an open order
    #[instrument(skip(self))]
    pub async fn modify_order(&self, order_id: &str, amount: Decimal) -> DeribitResult<OrderResponse> {
        require_non_empty("Order id", order_id)?;
        require_positive("Amount", amount)?;

        let params = [
            ("order_id", order_id.to_string()),
            ("amount", amount.to_string()),
        ];

        self.call("private/edit", &params, true).await
    }

    /// Cancel an order, returning the order as reported by Deribit
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: &str) -> DeribitResult<Value> {
        require_non_empty("Order id", order_id)?;

        self.call("private/cancel", &[("order_id", order_id.to_string())], true)
            .await
    }

    /// Fetch the order book for an instrument
    #[instrument(skip(self))]
    pub async fn get_order_book(&self, instrument: &str, depth: Option<u32>) -> DeribitResult<Value> {
        require_non_empty("Instrument name", instrument)?;

        let mut params = vec![("instrument_name", instrument.to_string())];
        if let Some(depth) = depth {
            params.push(("depth", depth.to_string()));
        }

        self.call("public/get_order_book", &params, false).await
    }

    /// Fetch open positions for a currency
    #[instrument(skip(self))]
    pub async fn get_positions(
        &self,
        currency: &str,
        kind: InstrumentKind,
    ) -> DeribitResult<Vec<Position>> {
        require_non_empty("Currency", currency)?;

        let params = [
            ("currency", currency.to_string()),
            ("kind", kind.as_str().to_string()),
        ];

        self.call("private/get_positions", &params, true).await
    }

    /// Issue a JSON-RPC call as a GET with query parameters
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
        private: bool,
    ) -> DeribitResult<T> {
        let url = format!("{}/{}", self.base_url, method);
        let mut request = self.client.get(&url).query(params);

        if private {
            let token = self.access_token.read().clone().ok_or_else(|| {
                DeribitError::auth(format!("{} requires authentication", method))
            })?;
            request = request.bearer_auth(token);
        }

        debug!("Calling Deribit: {}", method);

        let response = request
            .send()
            .await
            .map_err(|e| DeribitError::network(format!("{} request failed: {}", method, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeribitError::network(format!("{} response unreadable: {}", method, e)))?;

        match serde_json::from_str::<RpcResponse<T>>(&body) {
            Ok(rpc) => rpc.into_result(method),
            Err(_) if !status.is_success() => Err(DeribitError::api(format!(
                "Deribit API error ({}): {}",
                status, body
            ))),
            Err(e) => Err(DeribitError::parse(format!(
                "Failed to parse {} response: {}",
                method, e
            ))),
        }
    }
}

impl std::fmt::Debug for DeribitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeribitClient")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

#[async_trait]
impl SnapshotSource for DeribitClient {
    async fn fetch_snapshot(&self, symbol: &str) -> DeribitResult<Value> {
        self.get_order_book(symbol, self.book_depth)
            .await
            .map_err(|e| {
                debug!("Order book for {} unavailable: {}", symbol, e);
                DeribitError::unavailable(symbol)
            })
    }
}

fn require_non_empty(what: &str, value: &str) -> DeribitResult<()> {
    if value.trim().is_empty() {
        return Err(DeribitError::invalid_argument(format!("{} is empty", what)));
    }
    Ok(())
}

fn require_positive(what: &str, value: Decimal) -> DeribitResult<()> {
    if value <= Decimal::ZERO {
        return Err(DeribitError::invalid_argument(format!(
            "{} must be greater than zero",
            what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn authenticated(server: &MockServer) -> DeribitClient {
        Mock::given(method("GET"))
            .and(path("/public/auth"))
            .and(query_param("grant_type", "client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "result": {"access_token": "tok-1", "expires_in": 900, "token_type": "bearer"}
            })))
            .mount(server)
            .await;

        let client = DeribitClient::new(server.uri(), "id", "secret").unwrap();
        client.authenticate().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_authenticate_stores_token() {
        let server = MockServer::start().await;
        let client = authenticated(&server).await;
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_without_token_fails() {
        let server = MockServer::start().await;
        Mock::given(path("/public/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "result": {}})))
            .mount(&server)
            .await;

        let client = DeribitClient::new(server.uri(), "id", "secret").unwrap();
        let err = client.authenticate().await.unwrap_err();
        assert!(matches!(err, DeribitError::Auth(_)));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(path("/public/auth"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": {"code": 13004, "message": "invalid_credentials"}
            })))
            .mount(&server)
            .await;

        let client = DeribitClient::new(server.uri(), "id", "wrong").unwrap();
        let err = client.authenticate().await.unwrap_err();
        assert!(matches!(err, DeribitError::Auth(_)));
    }

    #[tokio::test]
    async fn test_private_call_requires_token() {
        let client = DeribitClient::new("http://127.0.0.1:9", "id", "secret").unwrap();
        let err = client
            .get_positions("BTC", InstrumentKind::Future)
            .await
            .unwrap_err();
        assert!(matches!(err, DeribitError::Auth(_)));
    }

    #[tokio::test]
    async fn test_place_order_uses_side_endpoint() {
        let server = MockServer::start().await;
        let client = authenticated(&server).await;

        Mock::given(method("GET"))
            .and(path("/private/sell"))
            .and(header("authorization", "Bearer tok-1"))
            .and(query_param("instrument_name", "BTC-PERPETUAL"))
            .and(query_param("amount", "10"))
            .and(query_param("type", "market"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "result": {"order": {"order_id": "BTC-42", "order_state": "filled"}, "trades": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client
            .place_order("BTC-PERPETUAL", dec!(10), OrderSide::Sell)
            .await
            .unwrap();
        assert_eq!(response.order_id(), Some("BTC-42"));
    }

    #[tokio::test]
    async fn test_invalid_order_arguments_are_rejected_locally() {
        let client = DeribitClient::new("http://127.0.0.1:9", "id", "secret").unwrap();

        let empty = client.place_order("", dec!(1), OrderSide::Buy).await;
        assert!(matches!(empty, Err(DeribitError::InvalidArgument(_))));

        let zero = client.place_order("BTC-PERPETUAL", dec!(0), OrderSide::Buy).await;
        assert!(matches!(zero, Err(DeribitError::InvalidArgument(_))));

        let negative = client.modify_order("BTC-1", dec!(-5)).await;
        assert!(matches!(negative, Err(DeribitError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_rpc_error_maps_to_api_error() {
        let server = MockServer::start().await;
        let client = authenticated(&server).await;

        Mock::given(path("/private/cancel"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": {"code": 10004, "message": "order_not_found"}
            })))
            .mount(&server)
            .await;

        let err = client.cancel_order("BTC-404").await.unwrap_err();
        assert!(matches!(err, DeribitError::Api(ref msg) if msg.contains("order_not_found")));
    }

    #[tokio::test]
    async fn test_snapshot_source_returns_book() {
        let server = MockServer::start().await;
        Mock::given(path("/public/get_order_book"))
            .and(query_param("instrument_name", "ETH-PERPETUAL"))
            .and(query_param("depth", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "result": {"instrument_name": "ETH-PERPETUAL", "bids": [[3500.0, 10.0]], "asks": []}
            })))
            .mount(&server)
            .await;

        let client = DeribitClient::new(server.uri(), "id", "secret")
            .unwrap()
            .with_depth(5);
        let book = client.fetch_snapshot("ETH-PERPETUAL").await.unwrap();
        assert_eq!(book["instrument_name"], "ETH-PERPETUAL");
        assert_eq!(book["bids"][0][0], 3500.0);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(path("/public/get_order_book"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = DeribitClient::new(server.uri(), "id", "secret").unwrap();
        let err = client.fetch_snapshot("BTC-PERPETUAL").await.unwrap_err();
        assert!(matches!(err, DeribitError::Unavailable(ref symbol) if symbol == "BTC-PERPETUAL"));
    }
}
