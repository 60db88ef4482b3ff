//! Exchange adapter layer: one uniform async surface over spot, futures and
//! prediction-market venues.
//!
//! The engine sees only [`ExchangeAdapter`]; each implementation owns its
//! own concurrency (stream tasks, request fan-out) and keeps every call
//! bounded by the sync timeout.

pub mod errors;
pub mod prediction;
pub mod prediction_rest;
pub mod registry;
pub mod rules;
pub mod spot;
pub mod spot_rest;
pub mod stream;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{OrderState, Side};
pub use errors::ExchangeError;
pub use rules::TradingRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Spot,
    Futures,
    Prediction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeInfo {
    pub id: String,
    pub name: String,
    pub kind: ExchangeKind,
}

/// How the venue debited the fee for a fill. Counter-order sizing dispatches
/// on this: an external-token fee never shrinks the counter-order quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeeAccounting {
    #[default]
    QuoteDeduction,
    ExternalToken,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    /// Venue pass-through parameters (positionSide, reduceOnly, ...).
    pub params: BTreeMap<String, String>,
}

impl OrderRequest {
    pub fn new(side: Side, price: f64, quantity: f64) -> Self {
        Self {
            side,
            price,
            quantity,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct EditOrderRequest {
    pub order_id: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

/// Per-element outcome of a batch operation. Partial success is normal: the
/// engine walks the results and installs or reports each element on its own.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub status: OrderState,
    pub placed_price: Option<f64>,
    pub placed_quantity: Option<f64>,
    pub error: Option<String>,
    /// Failures the caller should not turn into a notification.
    pub suppress_notify: bool,
}

impl OrderResult {
    pub fn placed(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            status: OrderState::Placed,
            placed_price: None,
            placed_quantity: None,
            error: None,
            suppress_notify: false,
        }
    }

    pub fn cancelled(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            status: OrderState::Cancelled,
            placed_price: None,
            placed_quantity: None,
            error: None,
            suppress_notify: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            status: OrderState::Failed,
            placed_price: None,
            placed_quantity: None,
            error: Some(error.into()),
            suppress_notify: false,
        }
    }

    pub fn from_error(err: &ExchangeError) -> Self {
        let mut result = Self::failed(err.to_string());
        result.suppress_notify = err.suppress_notify();
        result
    }
}

/// An order as the venue reports it.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub status: OrderState,
    pub fee: Option<f64>,
    pub fee_accounting: FeeAccounting,
    /// Prediction-market contract token the order belongs to.
    pub token_id: Option<String>,
    /// Raw venue payload, persisted alongside the trade when present.
    pub raw: Option<Value>,
}

impl ExchangeOrder {
    pub fn is_active(&self) -> bool {
        matches!(self.status, OrderState::Placed | OrderState::PartiallyFilled)
    }
}

/// Uniform venue surface consumed by the engine.
///
/// All operations are bounded: implementations must surface
/// [`ExchangeError::Timeout`] instead of blocking past their sync timeout.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Stable identity for the lifetime of the adapter.
    fn exchange_info(&self) -> ExchangeInfo;

    /// Lazy; cached on first success.
    async fn trading_rules(&self) -> Result<TradingRules, ExchangeError>;

    /// Taker rate preferred; falls back to market metadata, then 0.001.
    async fn fee_rate(&self) -> Result<f64, ExchangeError>;

    /// Single positive price.
    async fn ticker_price(&self) -> Result<f64, ExchangeError>;

    /// One result per request, order-preserving.
    async fn place_batch_orders(&self, orders: Vec<OrderRequest>) -> Vec<OrderResult>;

    async fn cancel_batch_orders(&self, order_ids: Vec<String>) -> Vec<OrderResult>;

    /// Semantically cancel+place per element; the result carries the new id.
    async fn edit_batch_orders(&self, edits: Vec<EditOrderRequest>) -> Vec<OrderResult>;

    /// May return None for an id the venue does not know.
    async fn get_order(&self, order_id: &str) -> Result<Option<ExchangeOrder>, ExchangeError>;

    /// Active (`Placed` or `PartiallyFilled`) orders for the bound symbol.
    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// Idempotent teardown.
    async fn close(&self);

    /// Free-form map merged into the engine's status snapshot.
    fn status_extra(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Prediction-market adapters invoke the listener after a contract
    /// rollover; other venues never call it.
    fn set_market_switch_listener(&self, _listener: Arc<dyn Fn() + Send + Sync>) {}
}
