//! Spot/futures adapter: the uniform adapter surface on top of the signed
//! REST client and the shared stream manager.
//!
//! Read ladder: stream cache first, REST as the authority. Write ladder:
//! per-order over the venue's order WebSocket when it has one, else the
//! batch REST endpoint in chunks of 5 where supported, else concurrent
//! per-order REST; cancels run the same ladder, and edits go WS-edit →
//! native REST amend → cancel+place.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::Side;
use crate::util::log_prefix::make_log_prefix;
use crate::util::retry::{retry_async, RetryConfig};

use super::spot_rest::{normalize_order, trim_float, SpotRestClient};
use super::stream::spot_stream::SpotStreamManager;
use super::{
    EditOrderRequest, ExchangeAdapter, ExchangeError, ExchangeInfo, ExchangeKind, ExchangeOrder,
    OrderRequest, OrderResult, TradingRules,
};

const BATCH_CHUNK: usize = 5;
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_FEE_RATE: f64 = 0.001;
const METADATA_RETRY_COOLDOWN: Duration = Duration::from_secs(5);

pub struct SpotAdapterConfig {
    pub venue_id: String,
    pub kind: ExchangeKind,
    pub api_key: String,
    pub api_secret: String,
    pub symbol: String,
    pub testnet: bool,
}

pub struct SpotAdapter {
    venue_id: String,
    kind: ExchangeKind,
    symbol: String,
    rest: SpotRestClient,
    stream: Mutex<Option<Arc<SpotStreamManager>>>,
    log_prefix: String,

    rules_cache: Mutex<Option<TradingRules>>,
    fee_cache: Mutex<Option<f64>>,
    metadata_last_attempt: Mutex<Option<Instant>>,
}

impl SpotAdapter {
    pub async fn connect(config: SpotAdapterConfig) -> Result<Self, ExchangeError> {
        let sync_timeout = std::env::var("EXCHANGE_SYNC_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|&v| v >= 1.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_SYNC_TIMEOUT);

        let rest = SpotRestClient::new(
            config.kind,
            config.api_key.clone(),
            config.api_secret.clone(),
            config.testnet,
            sync_timeout,
        )?;

        let log_prefix = make_log_prefix(&config.symbol, &config.api_key, &config.venue_id);

        if config.kind == ExchangeKind::Futures {
            rest.ensure_hedge_mode().await?;
        }

        let ws_orders = std::env::var("EXCHANGE_WS_ORDERS")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "off" | "OFF"))
            .unwrap_or(true);
        let stream = SpotStreamManager::acquire(
            config.kind,
            &config.venue_id,
            &config.api_key,
            &config.api_secret,
            config.testnet,
            rest.clone(),
            ws_orders,
            sync_timeout,
        );
        stream.subscribe(&config.symbol);
        info!("{log_prefix} adapter initialized with stream (ws_orders={ws_orders})");

        Ok(Self {
            venue_id: config.venue_id,
            kind: config.kind,
            symbol: config.symbol,
            rest,
            stream: Mutex::new(Some(stream)),
            log_prefix,
            rules_cache: Mutex::new(None),
            fee_cache: Mutex::new(None),
            metadata_last_attempt: Mutex::new(None),
        })
    }

    fn stream(&self) -> Option<Arc<SpotStreamManager>> {
        self.stream.lock().clone()
    }

    /// Metadata calls back off for a cooldown after a failure so a broken
    /// venue is not hammered every tick.
    fn metadata_attempt_allowed(&self) -> bool {
        let mut last = self.metadata_last_attempt.lock();
        if last.map_or(false, |at| at.elapsed() < METADATA_RETRY_COOLDOWN) {
            return false;
        }
        *last = Some(Instant::now());
        true
    }

    /// Shared shape for a limit order's WebSocket / REST parameters.
    fn order_params(&self, request: &OrderRequest) -> Vec<(String, String)> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("side".to_string(), request.side.as_str().to_uppercase()),
            ("type".to_string(), "LIMIT".to_string()),
            ("timeInForce".to_string(), "GTC".to_string()),
            ("quantity".to_string(), trim_float(request.quantity)),
            ("price".to_string(), trim_float(request.price)),
        ];
        for (key, value) in self.rest.forwardable_params(&request.params) {
            params.push((key.to_string(), value));
        }
        params
    }

    /// Streaming create: one `order.place` request over the order socket.
    async fn place_one_ws(
        &self,
        stream: &Arc<SpotStreamManager>,
        request: &OrderRequest,
    ) -> OrderResult {
        match stream
            .ws_api_call("order.place", self.order_params(request))
            .await
        {
            Ok(result) => match normalize_order(&result, &self.symbol) {
                Some(order) => {
                    stream.record_order(order.clone());
                    let mut placed = OrderResult::placed(order.order_id);
                    placed.placed_price = (order.price > 0.0).then_some(order.price);
                    placed.placed_quantity = (order.quantity > 0.0).then_some(order.quantity);
                    placed
                }
                None => OrderResult::failed(format!("ws order response missing id: {result}")),
            },
            Err(e) => {
                warn!("{} ws place order failed: {e}", self.log_prefix);
                OrderResult::from_error(&e)
            }
        }
    }

    /// Streaming cancel: `order.cancel` over the order socket.
    async fn cancel_one_ws(&self, stream: &Arc<SpotStreamManager>, order_id: &str) -> OrderResult {
        let params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        match stream.ws_api_call("order.cancel", params).await {
            Ok(_) => OrderResult::cancelled(order_id),
            Err(e) => {
                warn!(
                    "{} ws cancel failed order_id={order_id}: {e}",
                    self.log_prefix
                );
                let mut result = OrderResult::from_error(&e);
                result.order_id = Some(order_id.to_string());
                result
            }
        }
    }

    /// Streaming edit. Errors bubble up so the caller can drop to the next
    /// rung of the ladder.
    async fn edit_one_ws(
        &self,
        stream: &Arc<SpotStreamManager>,
        edit: &EditOrderRequest,
    ) -> Result<OrderResult, ExchangeError> {
        let result = match self.kind {
            ExchangeKind::Futures => {
                let params = vec![
                    ("symbol".to_string(), self.symbol.clone()),
                    ("orderId".to_string(), edit.order_id.clone()),
                    ("side".to_string(), edit.side.as_str().to_uppercase()),
                    ("quantity".to_string(), trim_float(edit.quantity)),
                    ("price".to_string(), trim_float(edit.price)),
                ];
                stream.ws_api_call("order.modify", params).await?
            }
            _ => {
                let params = vec![
                    ("symbol".to_string(), self.symbol.clone()),
                    ("cancelOrderId".to_string(), edit.order_id.clone()),
                    ("cancelReplaceMode".to_string(), "STOP_ON_FAILURE".to_string()),
                    ("side".to_string(), edit.side.as_str().to_uppercase()),
                    ("type".to_string(), "LIMIT".to_string()),
                    ("timeInForce".to_string(), "GTC".to_string()),
                    ("quantity".to_string(), trim_float(edit.quantity)),
                    ("price".to_string(), trim_float(edit.price)),
                ];
                let value = stream.ws_api_call("order.cancelReplace", params).await?;
                value.get("newOrderResponse").cloned().unwrap_or(value)
            }
        };

        let order = normalize_order(&result, &self.symbol)
            .ok_or_else(|| ExchangeError::Venue(format!("ws edit response missing id: {result}")))?;
        stream.record_order(order.clone());
        Ok(OrderResult::placed(order.order_id))
    }

    async fn place_one(&self, request: &OrderRequest) -> OrderResult {
        match self
            .rest
            .place_order(
                &self.symbol,
                request.side,
                request.price,
                request.quantity,
                &request.params,
            )
            .await
        {
            Ok(order) => {
                if let Some(stream) = self.stream() {
                    stream.record_order(order.clone());
                }
                let mut result = OrderResult::placed(order.order_id);
                result.placed_price = (order.price > 0.0).then_some(order.price);
                result.placed_quantity = (order.quantity > 0.0).then_some(order.quantity);
                result
            }
            Err(e) => {
                warn!("{} place order failed: {e}", self.log_prefix);
                OrderResult::from_error(&e)
            }
        }
    }

    async fn place_chunked_batch(&self, orders: &[OrderRequest]) -> Vec<OrderResult> {
        let mut results = Vec::with_capacity(orders.len());
        for chunk in orders.chunks(BATCH_CHUNK) {
            let batch: Vec<(Side, f64, f64, BTreeMap<String, String>)> = chunk
                .iter()
                .map(|o| (o.side, o.price, o.quantity, o.params.clone()))
                .collect();
            match self.rest.place_batch(&self.symbol, &batch).await {
                Ok(raw_results) => {
                    for (idx, raw) in raw_results.iter().enumerate() {
                        match normalize_order(raw, &self.symbol) {
                            Some(order) => {
                                if let Some(stream) = self.stream() {
                                    stream.record_order(order.clone());
                                }
                                results.push(OrderResult::placed(order.order_id));
                            }
                            None => {
                                let error = raw["msg"]
                                    .as_str()
                                    .or_else(|| raw["error"].as_str())
                                    .unwrap_or("unknown batch element error");
                                results.push(OrderResult::failed(error));
                                debug!(
                                    "{} batch element {idx} rejected: {error}",
                                    self.log_prefix
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "{} batch create failed: {e}, falling back to per-order",
                        self.log_prefix
                    );
                    let per_order = join_all(chunk.iter().map(|o| self.place_one(o))).await;
                    results.extend(per_order);
                }
            }
        }
        results
    }

    async fn cancel_one(&self, order_id: &str) -> OrderResult {
        match self.rest.cancel_order(&self.symbol, order_id).await {
            Ok(()) => OrderResult::cancelled(order_id),
            Err(e) => {
                warn!("{} cancel failed order_id={order_id}: {e}", self.log_prefix);
                let mut result = OrderResult::from_error(&e);
                result.order_id = Some(order_id.to_string());
                result
            }
        }
    }

    /// Batch cancel over REST, chunked like the batch create; a rejected
    /// chunk falls back to per-order cancels.
    async fn cancel_chunked_batch(&self, order_ids: &[String]) -> Vec<OrderResult> {
        let mut results = Vec::with_capacity(order_ids.len());
        for chunk in order_ids.chunks(BATCH_CHUNK) {
            match self.rest.cancel_batch(&self.symbol, chunk).await {
                Ok(raw_results) => {
                    for (idx, order_id) in chunk.iter().enumerate() {
                        match raw_results.get(idx) {
                            Some(raw)
                                if raw.get("code").is_some() && raw.get("orderId").is_none() =>
                            {
                                let error = raw["msg"]
                                    .as_str()
                                    .unwrap_or("batch cancel rejected")
                                    .to_string();
                                debug!(
                                    "{} batch cancel element rejected order_id={order_id}: {error}",
                                    self.log_prefix
                                );
                                let mut result = OrderResult::failed(error);
                                result.order_id = Some(order_id.clone());
                                results.push(result);
                            }
                            Some(_) => results.push(OrderResult::cancelled(order_id.clone())),
                            None => {
                                let mut result =
                                    OrderResult::failed("missing batch cancel element");
                                result.order_id = Some(order_id.clone());
                                results.push(result);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "{} batch cancel failed: {e}, falling back to per-order",
                        self.log_prefix
                    );
                    let per_order = join_all(chunk.iter().map(|id| self.cancel_one(id))).await;
                    results.extend(per_order);
                }
            }
        }
        results
    }

    /// Cancel+place fallback used when the native amend rejects an edit.
    async fn edit_via_cancel_place(&self, edit: &EditOrderRequest) -> OrderResult {
        let cancel = self.cancel_one(&edit.order_id).await;
        if !cancel.success {
            return cancel;
        }
        self.place_one(&OrderRequest::new(edit.side, edit.price, edit.quantity))
            .await
    }

    /// Edit ladder: WS-edit, then the native REST amend, then cancel+place.
    async fn edit_one(&self, edit: &EditOrderRequest) -> OrderResult {
        if let Some(stream) = self.stream() {
            if stream.supports_order_writes() {
                match self.edit_one_ws(&stream, edit).await {
                    Ok(result) => return result,
                    Err(e) => {
                        debug!(
                            "{} ws edit failed order_id={}: {e}, trying REST",
                            self.log_prefix, edit.order_id
                        );
                    }
                }
            }
        }

        match self
            .rest
            .edit_order(&self.symbol, &edit.order_id, edit.side, edit.price, edit.quantity)
            .await
        {
            Ok(order) => {
                if let Some(stream) = self.stream() {
                    stream.record_order(order.clone());
                }
                OrderResult::placed(order.order_id)
            }
            Err(e) => {
                debug!(
                    "{} native edit failed order_id={}: {e}, trying cancel+place",
                    self.log_prefix, edit.order_id
                );
                self.edit_via_cancel_place(edit).await
            }
        }
    }
}

#[async_trait]
impl ExchangeAdapter for SpotAdapter {
    fn exchange_info(&self) -> ExchangeInfo {
        ExchangeInfo {
            id: self.venue_id.clone(),
            name: self.venue_id.clone(),
            kind: self.kind,
        }
    }

    async fn trading_rules(&self) -> Result<TradingRules, ExchangeError> {
        if let Some(rules) = *self.rules_cache.lock() {
            return Ok(rules);
        }
        if !self.metadata_attempt_allowed() {
            return Err(ExchangeError::MarketUnavailable(
                "metadata retry cooling down".into(),
            ));
        }
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            ..RetryConfig::default()
        };
        let rules = retry_async(&retry, "trading_rules", ExchangeError::is_retriable, || {
            self.rest.trading_rules(&self.symbol)
        })
        .await?;
        info!(
            "{} trading rules: tick={} step={} min_notional={}",
            self.log_prefix, rules.tick_size, rules.step_size, rules.min_notional
        );
        *self.rules_cache.lock() = Some(rules);
        Ok(rules)
    }

    async fn fee_rate(&self) -> Result<f64, ExchangeError> {
        if let Some(rate) = *self.fee_cache.lock() {
            return Ok(rate);
        }

        match self.rest.taker_fee(&self.symbol).await {
            Ok(rate) => {
                info!("{} fee rate (api): taker={:.4}%", self.log_prefix, rate * 100.0);
                *self.fee_cache.lock() = Some(rate);
                return Ok(rate);
            }
            Err(e) => {
                debug!("{} fee endpoint unavailable: {e}", self.log_prefix);
            }
        }

        info!(
            "{} fee rate (default): taker={:.4}%",
            self.log_prefix,
            DEFAULT_FEE_RATE * 100.0
        );
        *self.fee_cache.lock() = Some(DEFAULT_FEE_RATE);
        Ok(DEFAULT_FEE_RATE)
    }

    async fn ticker_price(&self) -> Result<f64, ExchangeError> {
        if let Some(stream) = self.stream() {
            if let Some(price) = stream.get_price(&self.symbol) {
                return Ok(price);
            }
        }
        self.rest.ticker_price(&self.symbol).await
    }

    async fn place_batch_orders(&self, orders: Vec<OrderRequest>) -> Vec<OrderResult> {
        if orders.is_empty() {
            return Vec::new();
        }
        // Streaming create first, then batch REST, then per-order REST.
        if let Some(stream) = self.stream() {
            if stream.supports_order_writes() {
                return join_all(orders.iter().map(|o| self.place_one_ws(&stream, o))).await;
            }
        }
        if self.rest.supports_batch_orders() {
            self.place_chunked_batch(&orders).await
        } else {
            join_all(orders.iter().map(|o| self.place_one(o))).await
        }
    }

    async fn cancel_batch_orders(&self, order_ids: Vec<String>) -> Vec<OrderResult> {
        if order_ids.is_empty() {
            return Vec::new();
        }
        // Same ladder as placing: streaming, batch REST, per-order REST.
        if let Some(stream) = self.stream() {
            if stream.supports_order_writes() {
                return join_all(order_ids.iter().map(|id| self.cancel_one_ws(&stream, id)))
                    .await;
            }
        }
        if self.rest.supports_batch_orders() {
            self.cancel_chunked_batch(&order_ids).await
        } else {
            join_all(order_ids.iter().map(|id| self.cancel_one(id))).await
        }
    }

    async fn edit_batch_orders(&self, edits: Vec<EditOrderRequest>) -> Vec<OrderResult> {
        if edits.is_empty() {
            return Vec::new();
        }
        join_all(edits.iter().map(|e| self.edit_one(e))).await
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<ExchangeOrder>, ExchangeError> {
        // REST is authoritative on terminal status; the cache is the
        // consolation prize when REST is down.
        match self.rest.get_order(&self.symbol, order_id).await {
            Ok(order) => Ok(order),
            Err(e) => {
                warn!("{} get_order failed order_id={order_id}: {e}", self.log_prefix);
                Ok(self.stream().and_then(|s| s.get_order(order_id)))
            }
        }
    }

    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        if let Some(stream) = self.stream() {
            let cached = stream.get_open_orders(&self.symbol).await;
            if !cached.is_empty() {
                return Ok(cached);
            }
        }
        self.rest.open_orders(&self.symbol).await
    }

    async fn close(&self) {
        info!("{} closing", self.log_prefix);
        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            stream.unsubscribe(&self.symbol);
            SpotStreamManager::release(&stream);
        }
        info!("{} closed", self.log_prefix);
    }

    fn status_extra(&self) -> BTreeMap<String, Value> {
        let mut extra = BTreeMap::new();
        extra.insert(
            "ws_enabled".to_string(),
            Value::Bool(self.stream.lock().is_some()),
        );
        extra
    }
}
