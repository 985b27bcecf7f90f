//! Order tracking on top of the order API
//!
//! Keeps the set of orders this process placed (order id -> instrument)
//! and validates requests before they reach the exchange.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deribit_core::{DeribitError, DeribitResult, InstrumentKind, OrderSide};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{info, warn};

use crate::types::{OrderResponse, Position};
use crate::DeribitClient;

/// Placeholder id recorded when the exchange response carries none
pub const UNKNOWN_ORDER_ID: &str = "order_unknown";

/// Order operations the manager needs from the exchange
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(
        &self,
        instrument: &str,
        amount: Decimal,
        side: OrderSide,
    ) -> DeribitResult<OrderResponse>;

    async fn cancel_order(&self, order_id: &str) -> DeribitResult<Value>;

    async fn modify_order(&self, order_id: &str, amount: Decimal) -> DeribitResult<OrderResponse>;

    async fn get_positions(&self, currency: &str, kind: InstrumentKind) -> DeribitResult<Vec<Position>>;
}

#[async_trait]
impl OrderGateway for DeribitClient {
    async fn place_order(
        &self,
        instrument: &str,
        amount: Decimal,
        side: OrderSide,
    ) -> DeribitResult<OrderResponse> {
        DeribitClient::place_order(self, instrument, amount, side).await
    }

    async fn cancel_order(&self, order_id: &str) -> DeribitResult<Value> {
        DeribitClient::cancel_order(self, order_id).await
    }

    async fn modify_order(&self, order_id: &str, amount: Decimal) -> DeribitResult<OrderResponse> {
        DeribitClient::modify_order(self, order_id, amount).await
    }

    async fn get_positions(&self, currency: &str, kind: InstrumentKind) -> DeribitResult<Vec<Position>> {
        DeribitClient::get_positions(self, currency, kind).await
    }
}

/// Tracks orders placed through an [`OrderGateway`]
pub struct OrderManager {
    gateway: Arc<dyn OrderGateway>,
    active_orders: RwLock<HashMap<String, String>>,
}

impl OrderManager {
    pub fn new(gateway: Arc<dyn OrderGateway>) -> Self {
        Self {
            gateway,
            active_orders: RwLock::new(HashMap::new()),
        }
    }

    /// Place a market order and start tracking it
    ///
    /// Returns the exchange order id, or [`UNKNOWN_ORDER_ID`] when the
    /// response did not include one.
    pub async fn place_order(
        &self,
        instrument: &str,
        amount: Decimal,
        side: &str,
    ) -> DeribitResult<String> {
        if instrument.trim().is_empty() {
            return Err(DeribitError::invalid_argument("Instrument name is empty"));
        }
        if amount <= Decimal::ZERO {
            return Err(DeribitError::invalid_argument("Amount must be greater than zero"));
        }
        let side: OrderSide = side.parse()?;

        let response = self.gateway.place_order(instrument, amount, side).await?;
        let order_id = response
            .order_id()
            .unwrap_or(UNKNOWN_ORDER_ID)
            .to_string();

        self.active_orders
            .write()
            .insert(order_id.clone(), instrument.to_string());

        info!("Order placed: {} {} {} ({})", side, amount, instrument, order_id);
        Ok(order_id)
    }

    /// Cancel an order; an order this manager never tracked still counts as cancelled
    pub async fn cancel_order(&self, order_id: &str) -> DeribitResult<()> {
        if order_id.trim().is_empty() {
            return Err(DeribitError::invalid_argument("Order id is empty"));
        }

        self.gateway.cancel_order(order_id).await?;

        if self.active_orders.write().remove(order_id).is_some() {
            info!("Order cancelled: {}", order_id);
        } else {
            warn!("Order cancelled but was not tracked: {}", order_id);
        }
        Ok(())
    }

    /// Change an order's amount
    ///
    /// Returns whether the exchange acknowledged the edit with an order id.
    pub async fn modify_order(&self, order_id: &str, amount: Decimal) -> DeribitResult<bool> {
        if order_id.trim().is_empty() {
            return Err(DeribitError::invalid_argument("Order id is empty"));
        }
        if amount <= Decimal::ZERO {
            return Err(DeribitError::invalid_argument("New amount must be greater than zero"));
        }

        let response = self.gateway.modify_order(order_id, amount).await?;
        match response.order_id() {
            Some(id) => {
                info!("Order modified: {} -> {}", id, amount);
                Ok(true)
            }
            None => {
                warn!("Edit of {} returned no order id", order_id);
                Ok(false)
            }
        }
    }

    /// Fetch positions for a currency
    pub async fn get_position(
        &self,
        currency: &str,
        kind: InstrumentKind,
    ) -> DeribitResult<Vec<Position>> {
        if currency.trim().is_empty() {
            return Err(DeribitError::invalid_argument("Currency is empty"));
        }

        self.gateway.get_positions(currency, kind).await
    }

    /// Instrument of a tracked order
    pub fn instrument_of(&self, order_id: &str) -> Option<String> {
        self.active_orders.read().get(order_id).cloned()
    }

    /// Ids of all tracked orders
    pub fn active_orders(&self) -> Vec<String> {
        self.active_orders.read().keys().cloned().collect()
    }
}
