//! Prediction-market adapter: ephemeral per-period up/down contracts.
//!
//! A symbol like `btc-Up` binds to a fresh contract token every period
//! (5m/15m/1h/1d). The adapter resolves the token from a slug built off the
//! period-aligned start timestamp, and near period end runs the rollover:
//! cancel opening orders, flatten the held outcome, swap to the next token
//! and tell the engine to forget the retired contract.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use chrono_tz::America::New_York;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::domain::Side;
use crate::util::log_prefix::make_log_prefix;

use super::prediction_rest::PredictionRestClient;
use super::stream::prediction_stream::PredictionStreamManager;
use super::{
    EditOrderRequest, ExchangeAdapter, ExchangeError, ExchangeInfo, ExchangeKind, ExchangeOrder,
    OrderRequest, OrderResult, TradingRules,
};

const NEXT_TOKEN_RETRIES: u32 = 6;
const NEXT_TOKEN_RETRY_DELAY: Duration = Duration::from_secs(2);
const LIQUIDATION_MIN_BALANCE: f64 = 1.0;
/// Guaranteed-to-cross price for the fill-or-kill liquidation sell.
const LIQUIDATION_PRICE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketPeriod {
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl MarketPeriod {
    pub fn seconds(&self) -> i64 {
        match self {
            MarketPeriod::FiveMinutes => 5 * 60,
            MarketPeriod::FifteenMinutes => 15 * 60,
            MarketPeriod::OneHour => 3600,
            MarketPeriod::OneDay => 24 * 3600,
        }
    }

    pub fn default_close_buffer(&self) -> i64 {
        match self {
            MarketPeriod::FiveMinutes => 60,
            MarketPeriod::FifteenMinutes => 0,
            MarketPeriod::OneHour => 60,
            MarketPeriod::OneDay => 1800,
        }
    }

    fn venue_id(&self) -> &'static str {
        match self {
            MarketPeriod::FiveMinutes => "polymarket_updown5m",
            MarketPeriod::FifteenMinutes => "polymarket_updown15m",
            MarketPeriod::OneHour => "polymarket_updown1h",
            MarketPeriod::OneDay => "polymarket_updown1d",
        }
    }

    fn slug_infix(&self) -> &'static str {
        match self {
            MarketPeriod::FiveMinutes => "5m",
            MarketPeriod::FifteenMinutes => "15m",
            MarketPeriod::OneHour => "1h",
            MarketPeriod::OneDay => "1d",
        }
    }

    /// Start of the period `offset` periods from now. Intraday periods
    /// align on unix-time boundaries; the daily product aligns on eastern
    /// midnight because that is how the venue dates its contracts.
    pub fn aligned_start(&self, offset: i64) -> i64 {
        match self {
            MarketPeriod::OneDay => {
                let today = Utc::now().with_timezone(&New_York).date_naive();
                let day = today + chrono::Duration::days(offset);
                let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
                New_York
                    .from_local_datetime(&midnight)
                    .earliest()
                    .map(|dt| dt.timestamp())
                    .unwrap_or_else(|| Utc::now().timestamp())
            }
            _ => {
                let now = Utc::now().timestamp();
                let period = self.seconds();
                now - now.rem_euclid(period) + offset * period
            }
        }
    }
}

/// Asset names the venue spells out in daily slugs.
fn daily_market_name(asset: &str) -> &str {
    match asset {
        "btc" => "bitcoin",
        "eth" => "ethereum",
        "sol" => "solana",
        other => other,
    }
}

#[derive(Debug, Clone, Default)]
struct MarketState {
    slug: String,
    token_id: String,
    end_time: i64,
    condition_id: Option<String>,
}

pub struct PredictionAdapter {
    period: MarketPeriod,
    asset: String,
    outcome: String,
    symbol: String,
    close_buffer: i64,
    rest: PredictionRestClient,
    stream: Mutex<Option<Arc<PredictionStreamManager>>>,
    log_prefix: String,

    market: Mutex<MarketState>,
    rollover_guard: tokio::sync::Mutex<()>,
    is_closing: AtomicBool,
    rules: TradingRules,
    market_switch_listener: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl PredictionAdapter {
    pub async fn connect(
        period: MarketPeriod,
        api_key: String,
        api_secret: String,
        symbol: String,
    ) -> Result<Self, ExchangeError> {
        let (asset, outcome) = parse_symbol(&symbol)?;
        if period == MarketPeriod::FiveMinutes && asset != "btc" {
            return Err(ExchangeError::InvalidSymbol(format!(
                "5m market only lists btc, got {asset}"
            )));
        }

        let rest = PredictionRestClient::new(api_key.clone(), api_secret.clone())?;
        let log_prefix = make_log_prefix(&symbol, &api_key, period.venue_id());

        let adapter = Self {
            period,
            asset,
            outcome,
            symbol: symbol.clone(),
            close_buffer: period.default_close_buffer(),
            rest,
            stream: Mutex::new(Some(PredictionStreamManager::acquire(&api_key, &api_secret))),
            log_prefix,
            market: Mutex::new(MarketState::default()),
            rollover_guard: tokio::sync::Mutex::new(()),
            is_closing: AtomicBool::new(false),
            rules: TradingRules {
                tick_size: 0.01,
                price_decimals: 2,
                step_size: 1.0,
                qty_decimals: 0,
                min_notional: 0.0,
            },
            market_switch_listener: Mutex::new(None),
        };

        adapter.refresh_current_market().await?;
        info!("{} adapter initialized", adapter.log_prefix);
        Ok(adapter)
    }

    fn stream(&self) -> Option<Arc<PredictionStreamManager>> {
        self.stream.lock().clone()
    }

    fn token_id(&self) -> String {
        self.market.lock().token_id.clone()
    }

    fn build_slug(&self, start_ts: i64) -> String {
        match self.period {
            MarketPeriod::OneDay => {
                let day = Utc
                    .timestamp_opt(start_ts, 0)
                    .single()
                    .unwrap_or_else(Utc::now)
                    .with_timezone(&New_York);
                let month = day.format("%B").to_string().to_lowercase();
                format!(
                    "{}-up-or-down-on-{month}-{}",
                    daily_market_name(&self.asset),
                    day.day()
                )
            }
            _ => format!(
                "{}-updown-{}-{start_ts}",
                self.asset,
                self.period.slug_infix()
            ),
        }
    }

    /// Resolve the contract token for a period start; updates market state
    /// on success.
    async fn resolve_market(&self, start_ts: i64) -> Result<Option<String>, ExchangeError> {
        let slug = self.build_slug(start_ts);
        let Some(market) = self.rest.market_by_slug(&slug).await? else {
            return Ok(None);
        };
        let Some(token_id) = market.token_for_outcome(&self.outcome) else {
            return Ok(None);
        };

        let mut state = self.market.lock();
        state.slug = slug;
        state.end_time = start_ts + self.period.seconds();
        state.condition_id = market.condition_id.clone();
        Ok(Some(token_id))
    }

    async fn refresh_current_market(&self) -> Result<(), ExchangeError> {
        let start = self.period.aligned_start(0);
        let token_id = self
            .resolve_market(start)
            .await?
            .ok_or_else(|| {
                ExchangeError::MarketUnavailable(format!(
                    "no market for {} at {start}",
                    self.symbol
                ))
            })?;

        let previous = {
            let mut state = self.market.lock();
            let previous = std::mem::replace(&mut state.token_id, token_id.clone());
            (previous != state.token_id).then_some(previous)
        };

        if let Some(stream) = self.stream() {
            if let Some(previous) = previous.filter(|p| !p.is_empty()) {
                stream.unsubscribe_token(&previous);
            }
            stream.subscribe_token(&token_id, &self.symbol);
        }

        let state = self.market.lock().clone();
        info!(
            "{} market resolved token_id={} slug={} end_time={}",
            self.log_prefix,
            &token_id[..token_id.len().min(16)],
            state.slug,
            state.end_time
        );
        Ok(())
    }

    fn seconds_until_close(&self) -> i64 {
        let end_time = self.market.lock().end_time;
        if end_time == 0 {
            return 0;
        }
        (end_time - Utc::now().timestamp()).max(0)
    }

    fn is_closing_soon(&self) -> bool {
        self.close_buffer > 0
            && self.market.lock().end_time > 0
            && self.seconds_until_close() <= self.close_buffer
    }

    async fn ensure_market_valid(&self) -> Result<(), ExchangeError> {
        if self.token_id().is_empty() {
            self.refresh_current_market().await?;
        }
        if self.is_closing_soon() {
            self.handle_rollover().await;
        }
        Ok(())
    }

    /// The rollover sequence. Runs at most once at a time; concurrent
    /// callers fall through.
    async fn handle_rollover(&self) {
        let Ok(_guard) = self.rollover_guard.try_lock() else { return };
        if self.is_closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let old_token = self.token_id();
        warn!(
            "{} market closing soon token_id={} seconds_left={}",
            self.log_prefix,
            &old_token[..old_token.len().min(16)],
            self.seconds_until_close()
        );

        self.cancel_opening_orders().await;
        self.liquidate_holdings(&old_token).await;

        match self.resolve_next_token().await {
            Some(new_token) if new_token != old_token => {
                if let Some(stream) = self.stream() {
                    stream.clear_orders_for_token(&old_token);
                    stream.unsubscribe_token(&old_token);
                    stream.subscribe_token(&new_token, &self.symbol);
                }
                self.market.lock().token_id = new_token.clone();
                info!(
                    "{} switched to next market token_id={}",
                    self.log_prefix,
                    &new_token[..new_token.len().min(16)]
                );
                let listener = self.market_switch_listener.lock().clone();
                if let Some(listener) = listener {
                    listener();
                }
            }
            Some(_) => {
                info!("{} next market resolves to current token, keeping it", self.log_prefix);
            }
            None => {
                // Fall back to re-resolving the current period; it may have
                // just begun.
                info!("{} next token unresolved, refreshing current market", self.log_prefix);
                if let Err(e) = self.refresh_current_market().await {
                    warn!("{} current market refresh failed: {e}", self.log_prefix);
                }
            }
        }

        self.is_closing.store(false, Ordering::SeqCst);
    }

    async fn resolve_next_token(&self) -> Option<String> {
        let next_start = self.period.aligned_start(1);
        for attempt in 1..=NEXT_TOKEN_RETRIES {
            match self.resolve_market(next_start).await {
                Ok(Some(token)) => return Some(token),
                Ok(None) => {}
                Err(e) => warn!(
                    "{} next market lookup attempt {attempt} failed: {e}",
                    self.log_prefix
                ),
            }
            if attempt < NEXT_TOKEN_RETRIES {
                tokio::time::sleep(NEXT_TOKEN_RETRY_DELAY).await;
            }
        }
        None
    }

    async fn cancel_opening_orders(&self) {
        match self.open_orders().await {
            Ok(orders) => {
                let buy_ids: Vec<String> = orders
                    .iter()
                    .filter(|o| o.side == Side::Buy)
                    .map(|o| o.order_id.clone())
                    .collect();
                if !buy_ids.is_empty() {
                    self.cancel_batch_orders(buy_ids).await;
                }
            }
            Err(e) => warn!("{} cancel opening orders failed: {e}", self.log_prefix),
        }
    }

    /// Flatten whatever the account still holds in the retiring contract
    /// with a fill-or-kill sell priced to cross the whole book.
    async fn liquidate_holdings(&self, token_id: &str) {
        let balance = match self.rest.token_balance(token_id).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("{} balance lookup failed: {e}", self.log_prefix);
                return;
            }
        };
        if balance < LIQUIDATION_MIN_BALANCE {
            return;
        }

        match self
            .rest
            .place_order(token_id, Side::Sell, LIQUIDATION_PRICE, balance.floor(), "FOK")
            .await
        {
            Ok(order_id) => info!(
                "{} liquidated position qty={} order_id={order_id}",
                self.log_prefix,
                balance.floor()
            ),
            Err(e) => warn!("{} liquidation failed: {e}", self.log_prefix),
        }
    }

    async fn place_one(&self, request: &OrderRequest) -> OrderResult {
        if self.is_closing_soon() {
            return OrderResult::from_error(&ExchangeError::MarketClosing);
        }
        if request.price <= 0.0 || request.quantity <= 0.0 {
            return OrderResult::failed("price and quantity must be positive");
        }

        let token_id = self.token_id();
        match self
            .rest
            .place_order(&token_id, request.side, request.price, request.quantity, "GTC")
            .await
        {
            Ok(order_id) => {
                if let Some(stream) = self.stream() {
                    stream.record_order(ExchangeOrder {
                        order_id: order_id.clone(),
                        symbol: self.symbol.clone(),
                        side: request.side,
                        price: request.price,
                        quantity: request.quantity,
                        filled_quantity: 0.0,
                        status: crate::domain::OrderState::Placed,
                        fee: None,
                        fee_accounting: super::FeeAccounting::ExternalToken,
                        token_id: Some(token_id),
                        raw: None,
                    });
                }
                OrderResult::placed(order_id)
            }
            Err(e) => {
                warn!("{} place order failed: {e}", self.log_prefix);
                OrderResult::from_error(&e)
            }
        }
    }

    async fn cancel_one(&self, order_id: &str) -> OrderResult {
        match self.rest.cancel_order(order_id).await {
            Ok(()) => {
                if let Some(stream) = self.stream() {
                    if let Some(mut order) = stream.get_order(order_id) {
                        order.status = crate::domain::OrderState::Cancelled;
                        stream.record_order(order);
                    }
                }
                OrderResult::cancelled(order_id)
            }
            Err(e) => {
                warn!("{} cancel failed order_id={order_id}: {e}", self.log_prefix);
                let mut result = OrderResult::from_error(&e);
                result.order_id = Some(order_id.to_string());
                result
            }
        }
    }
}

fn parse_symbol(symbol: &str) -> Result<(String, String), ExchangeError> {
    let mut parts = symbol.trim().splitn(2, '-');
    let asset = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?
        .to_lowercase();
    let outcome = parts
        .next()
        .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?;
    let outcome = match outcome.to_lowercase().as_str() {
        "up" => "Up".to_string(),
        "down" => "Down".to_string(),
        _ => {
            return Err(ExchangeError::InvalidSymbol(format!(
                "{symbol}: outcome must be Up or Down"
            )))
        }
    };
    Ok((asset, outcome))
}

#[async_trait]
impl ExchangeAdapter for PredictionAdapter {
    fn exchange_info(&self) -> ExchangeInfo {
        ExchangeInfo {
            id: self.period.venue_id().to_string(),
            name: self.period.venue_id().to_string(),
            kind: ExchangeKind::Prediction,
        }
    }

    async fn trading_rules(&self) -> Result<TradingRules, ExchangeError> {
        Ok(self.rules)
    }

    async fn fee_rate(&self) -> Result<f64, ExchangeError> {
        Ok(0.0)
    }

    async fn ticker_price(&self) -> Result<f64, ExchangeError> {
        self.ensure_market_valid().await?;
        let token_id = self.token_id();
        if token_id.is_empty() {
            return Err(ExchangeError::MarketUnavailable("token not resolved".into()));
        }

        if let Some(stream) = self.stream() {
            if let Some(price) = stream.get_price(&token_id) {
                return Ok(price);
            }
        }
        self.rest.midpoint(&token_id).await
    }

    async fn place_batch_orders(&self, orders: Vec<OrderRequest>) -> Vec<OrderResult> {
        if orders.is_empty() {
            return Vec::new();
        }
        if let Err(e) = self.ensure_market_valid().await {
            return orders.iter().map(|_| OrderResult::from_error(&e)).collect();
        }
        if self.is_closing_soon() {
            let err = ExchangeError::MarketClosing;
            return orders.iter().map(|_| OrderResult::from_error(&err)).collect();
        }

        // The venue has no batch endpoint; fan out per order.
        join_all(orders.iter().map(|o| self.place_one(o))).await
    }

    async fn cancel_batch_orders(&self, order_ids: Vec<String>) -> Vec<OrderResult> {
        if order_ids.is_empty() {
            return Vec::new();
        }
        join_all(order_ids.iter().map(|id| self.cancel_one(id))).await
    }

    async fn edit_batch_orders(&self, edits: Vec<EditOrderRequest>) -> Vec<OrderResult> {
        let mut results = Vec::with_capacity(edits.len());
        for edit in &edits {
            let cancel = self.cancel_one(&edit.order_id).await;
            if !cancel.success {
                results.push(cancel);
                continue;
            }
            results.push(
                self.place_one(&OrderRequest::new(edit.side, edit.price, edit.quantity))
                    .await,
            );
        }
        results
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<ExchangeOrder>, ExchangeError> {
        match self.rest.get_order(order_id, &self.symbol).await {
            Ok(Some(order)) => Ok(Some(order)),
            Ok(None) => Ok(self.stream().and_then(|s| s.get_order(order_id))),
            Err(e) => {
                warn!("{} get_order failed order_id={order_id}: {e}", self.log_prefix);
                Ok(self.stream().and_then(|s| s.get_order(order_id)))
            }
        }
    }

    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.ensure_market_valid().await?;
        let token_id = self.token_id();
        if token_id.is_empty() {
            return Ok(Vec::new());
        }

        match self.rest.open_orders(&self.symbol).await {
            Ok(orders) => {
                let scoped: Vec<ExchangeOrder> = orders
                    .into_iter()
                    .filter(|o| o.token_id.as_deref().map_or(true, |t| t == token_id))
                    .collect();
                if let Some(stream) = self.stream() {
                    for order in &scoped {
                        stream.record_order(order.clone());
                    }
                }
                Ok(scoped)
            }
            Err(e) => {
                warn!("{} open_orders REST failed: {e}", self.log_prefix);
                Ok(self
                    .stream()
                    .map(|s| s.get_open_orders(&token_id))
                    .unwrap_or_default())
            }
        }
    }

    async fn close(&self) {
        info!("{} closing", self.log_prefix);
        let token_id = self.token_id();
        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            if !token_id.is_empty() {
                stream.unsubscribe_token(&token_id);
            }
            PredictionStreamManager::release(&stream);
        }
        info!("{} closed", self.log_prefix);
    }

    fn status_extra(&self) -> BTreeMap<String, Value> {
        let state = self.market.lock().clone();
        let mut extra = BTreeMap::new();
        extra.insert("market_slug".to_string(), json!(state.slug));
        extra.insert("token_id".to_string(), json!(state.token_id));
        extra.insert("market_end_time".to_string(), json!(state.end_time));
        extra.insert(
            "seconds_until_close".to_string(),
            json!(self.seconds_until_close()),
        );
        extra.insert(
            "is_closing".to_string(),
            json!(self.is_closing.load(Ordering::SeqCst)),
        );
        if let Some(condition_id) = state.condition_id {
            extra.insert("condition_id".to_string(), json!(condition_id));
        }
        extra
    }

    fn set_market_switch_listener(&self, listener: Arc<dyn Fn() + Send + Sync>) {
        *self.market_switch_listener.lock() = Some(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_parses_asset_and_outcome() {
        assert_eq!(parse_symbol("btc-Up").unwrap(), ("btc".into(), "Up".into()));
        assert_eq!(
            parse_symbol("ETH-down").unwrap(),
            ("eth".into(), "Down".into())
        );
        assert!(parse_symbol("btc").is_err());
        assert!(parse_symbol("btc-Sideways").is_err());
    }

    #[test]
    fn intraday_alignment_lands_on_period_boundaries() {
        for period in [
            MarketPeriod::FiveMinutes,
            MarketPeriod::FifteenMinutes,
            MarketPeriod::OneHour,
        ] {
            let start = period.aligned_start(0);
            assert_eq!(start % period.seconds(), 0);
            let next = period.aligned_start(1);
            assert_eq!(next - start, period.seconds());
        }
    }

    #[test]
    fn daily_slug_names_the_asset() {
        assert_eq!(daily_market_name("btc"), "bitcoin");
        assert_eq!(daily_market_name("xrp"), "xrp");
    }

    #[test]
    fn close_buffers_match_the_period() {
        assert_eq!(MarketPeriod::FiveMinutes.default_close_buffer(), 60);
        assert_eq!(MarketPeriod::FifteenMinutes.default_close_buffer(), 0);
        assert_eq!(MarketPeriod::OneHour.default_close_buffer(), 60);
        assert_eq!(MarketPeriod::OneDay.default_close_buffer(), 1800);
    }
}
