//! Prediction-market stream manager: dual sockets (market data + user
//! events) with dynamic per-token subscribe/unsubscribe.
//!
//! Contracts roll over every few minutes, so unlike the spot stream the
//! subscription set churns constantly on a live connection, and rollover
//! clears the retired token's slice of the caches in one call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::domain::OrderState;
use crate::exchange::prediction_rest::normalize_clob_order;
use crate::exchange::ExchangeOrder;

use super::{
    evict_terminal_orders, PRICE_MAX_AGE, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY,
    STATS_LOG_INTERVAL,
};

const MARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
const USER_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/user";
const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// (api_key, api_secret)
type StreamKey = (String, String);

#[derive(Debug)]
enum TokenCommand {
    Subscribe(String),
    Unsubscribe(String),
}

fn pool() -> &'static Mutex<HashMap<StreamKey, (usize, Arc<PredictionStreamManager>)>> {
    static POOL: OnceLock<Mutex<HashMap<StreamKey, (usize, Arc<PredictionStreamManager>)>>> =
        OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct PredictionStreamManager {
    key: StreamKey,
    log_prefix: String,

    /// token_id -> (midpoint, updated_at)
    prices: RwLock<HashMap<String, (f64, Instant)>>,
    /// token_id -> (best_bid, best_ask, updated_at)
    best_quotes: RwLock<HashMap<String, (f64, f64, Instant)>>,
    orders: RwLock<HashMap<String, ExchangeOrder>>,
    subscribed_tokens: RwLock<HashSet<String>>,
    /// token_id -> human display symbol for log lines.
    display_map: RwLock<HashMap<String, String>>,

    cmd_tx: mpsc::Sender<TokenCommand>,
    running: Arc<AtomicBool>,

    stats_price_updates: AtomicU64,
    stats_order_msgs: AtomicU64,
}

impl PredictionStreamManager {
    pub fn acquire(api_key: &str, api_secret: &str) -> Arc<Self> {
        let key: StreamKey = (api_key.to_string(), api_secret.to_string());
        let mut pool = pool().lock();
        if let Some((ref_count, manager)) = pool.get_mut(&key) {
            if manager.running.load(Ordering::SeqCst) {
                *ref_count += 1;
                debug!("{} reuse stream, ref_count={ref_count}", manager.log_prefix);
                return manager.clone();
            }
            warn!("{} replacing stale stream instance", manager.log_prefix);
            pool.remove(&key);
        }

        let key_prefix: String = api_key.chars().take(8).collect();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let manager = Arc::new(Self {
            key: key.clone(),
            log_prefix: format!("[{key_prefix}] [prediction]"),
            prices: RwLock::new(HashMap::new()),
            best_quotes: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            subscribed_tokens: RwLock::new(HashSet::new()),
            display_map: RwLock::new(HashMap::new()),
            cmd_tx,
            running: Arc::new(AtomicBool::new(true)),
            stats_price_updates: AtomicU64::new(0),
            stats_order_msgs: AtomicU64::new(0),
        });

        manager.spawn_tasks(cmd_rx);
        pool.insert(key, (1, manager.clone()));
        info!("{} created stream, ref_count=1", manager.log_prefix);
        manager
    }

    pub fn release(manager: &Arc<Self>) {
        let mut pool = pool().lock();
        let Some((ref_count, _)) = pool.get_mut(&manager.key) else {
            return;
        };
        *ref_count -= 1;
        let remaining = *ref_count;
        debug!("{} release stream, ref_count={remaining}", manager.log_prefix);
        if remaining == 0 {
            pool.remove(&manager.key);
            manager.running.store(false, Ordering::SeqCst);
            info!("{} stream shut down", manager.log_prefix);
        }
    }

    pub fn subscribe_token(&self, token_id: &str, display_symbol: &str) {
        let is_new = self.subscribed_tokens.write().insert(token_id.to_string());
        self.display_map
            .write()
            .insert(token_id.to_string(), display_symbol.to_string());
        if is_new {
            let _ = self.cmd_tx.try_send(TokenCommand::Subscribe(token_id.to_string()));
        }
        info!("{} subscribed token_id={}", self.log_prefix, &token_id[..token_id.len().min(16)]);
    }

    pub fn unsubscribe_token(&self, token_id: &str) {
        let was_present = self.subscribed_tokens.write().remove(token_id);
        self.display_map.write().remove(token_id);
        self.prices.write().remove(token_id);
        self.best_quotes.write().remove(token_id);
        if was_present {
            let _ = self.cmd_tx.try_send(TokenCommand::Unsubscribe(token_id.to_string()));
        }
        debug!("{} unsubscribed token_id={}", self.log_prefix, &token_id[..token_id.len().min(16)]);
    }

    pub fn get_price(&self, token_id: &str) -> Option<f64> {
        let prices = self.prices.read();
        let (price, at) = prices.get(token_id)?;
        (at.elapsed() <= PRICE_MAX_AGE).then_some(*price)
    }

    pub fn get_top_of_book(&self, token_id: &str) -> Option<(f64, f64)> {
        let quotes = self.best_quotes.read();
        let (bid, ask, at) = quotes.get(token_id)?;
        (at.elapsed() <= PRICE_MAX_AGE).then_some((*bid, *ask))
    }

    pub fn get_order(&self, order_id: &str) -> Option<ExchangeOrder> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn record_order(&self, order: ExchangeOrder) {
        let mut orders = self.orders.write();
        orders.insert(order.order_id.clone(), order);
        evict_terminal_orders(&mut orders);
    }

    pub fn get_open_orders(&self, token_id: &str) -> Vec<ExchangeOrder> {
        self.orders
            .read()
            .values()
            .filter(|o| o.token_id.as_deref() == Some(token_id) && o.is_active())
            .cloned()
            .collect()
    }

    /// Forget the retired contract's orders on rollover.
    pub fn clear_orders_for_token(&self, token_id: &str) {
        let mut orders = self.orders.write();
        let stale: Vec<String> = orders
            .values()
            .filter(|o| o.token_id.as_deref() == Some(token_id))
            .map(|o| o.order_id.clone())
            .collect();
        for id in stale {
            orders.remove(&id);
        }
    }

    // ==================== socket tasks ====================

    fn spawn_tasks(self: &Arc<Self>, cmd_rx: mpsc::Receiver<TokenCommand>) {
        let market = self.clone();
        tokio::spawn(async move { market.run_market_ws(cmd_rx).await });

        let user = self.clone();
        tokio::spawn(async move { user.run_user_ws().await });

        let stats = self.clone();
        tokio::spawn(async move { stats.run_stats_loop().await });
    }

    async fn run_market_ws(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<TokenCommand>) {
        let mut delay = RECONNECT_BASE_DELAY;
        while self.running.load(Ordering::SeqCst) {
            match connect_async(MARKET_WS_URL).await {
                Ok((mut ws, _)) => {
                    info!("{} market WS connected", self.log_prefix);
                    delay = RECONNECT_BASE_DELAY;

                    let tokens: Vec<String> =
                        self.subscribed_tokens.read().iter().cloned().collect();
                    if !tokens.is_empty() {
                        let _ = ws
                            .send(Message::Text(
                                json!({ "assets_ids": tokens, "type": "market" }).to_string(),
                            ))
                            .await;
                    }

                    let mut ping = tokio::time::interval(PING_INTERVAL);
                    loop {
                        if !self.running.load(Ordering::SeqCst) {
                            let _ = ws.close(None).await;
                            return;
                        }
                        tokio::select! {
                            _ = ping.tick() => {
                                if ws.send(Message::Text("PING".to_string())).await.is_err() {
                                    break;
                                }
                            }
                            command = cmd_rx.recv() => {
                                let Some(command) = command else { return };
                                let payload = match command {
                                    TokenCommand::Subscribe(token) => json!({
                                        "assets_ids": [token], "operation": "subscribe",
                                    }),
                                    TokenCommand::Unsubscribe(token) => json!({
                                        "assets_ids": [token], "operation": "unsubscribe",
                                    }),
                                };
                                if ws.send(Message::Text(payload.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            frame = ws.next() => {
                                match frame {
                                    Some(Ok(Message::Text(text))) => self.handle_market_message(&text),
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = ws.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        warn!("{} market WS error: {e}", self.log_prefix);
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("{} market WS connect failed: {e}", self.log_prefix);
                }
            }

            if self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }

    fn handle_market_message(&self, text: &str) {
        if text == "PONG" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(text) else { return };
        match value {
            Value::Array(items) => {
                for item in items {
                    self.process_market_event(&item);
                }
            }
            item => self.process_market_event(&item),
        }
    }

    /// Book snapshots carry bids/asks; price_change events carry per-level
    /// updates. Either way the cache keeps the freshest midpoint.
    fn process_market_event(&self, data: &Value) {
        let Some(token_id) = data["asset_id"].as_str().or_else(|| data["market"].as_str()) else {
            return;
        };
        if !self.subscribed_tokens.read().contains(token_id) {
            return;
        }

        let best_bid = best_level(&data["bids"], true).or_else(|| str_f64(&data["best_bid"]));
        let best_ask = best_level(&data["asks"], false).or_else(|| str_f64(&data["best_ask"]));

        let (Some(bid), Some(ask)) = (best_bid, best_ask) else { return };
        if bid <= 0.0 || ask <= 0.0 {
            return;
        }
        let mid = (bid + ask) / 2.0;
        let now = Instant::now();
        self.prices.write().insert(token_id.to_string(), (mid, now));
        self.best_quotes
            .write()
            .insert(token_id.to_string(), (bid, ask, now));
        self.stats_price_updates.fetch_add(1, Ordering::Relaxed);
    }

    async fn run_user_ws(self: Arc<Self>) {
        let mut delay = RECONNECT_BASE_DELAY;
        while self.running.load(Ordering::SeqCst) {
            match connect_async(USER_WS_URL).await {
                Ok((mut ws, _)) => {
                    info!("{} user WS connected", self.log_prefix);
                    delay = RECONNECT_BASE_DELAY;

                    let auth = json!({
                        "auth": { "apiKey": self.key.0 },
                        "type": "user",
                        "markets": [],
                    });
                    let _ = ws.send(Message::Text(auth.to_string())).await;

                    let mut ping = tokio::time::interval(PING_INTERVAL);
                    loop {
                        if !self.running.load(Ordering::SeqCst) {
                            let _ = ws.close(None).await;
                            return;
                        }
                        tokio::select! {
                            _ = ping.tick() => {
                                if ws.send(Message::Text("PING".to_string())).await.is_err() {
                                    break;
                                }
                            }
                            frame = ws.next() => {
                                match frame {
                                    Some(Ok(Message::Text(text))) => self.handle_user_message(&text),
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = ws.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        warn!("{} user WS error: {e}", self.log_prefix);
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("{} user WS connect failed: {e}", self.log_prefix);
                }
            }

            if self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }

    fn handle_user_message(&self, text: &str) {
        if text == "PONG" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(text) else { return };
        let events = match value {
            Value::Array(items) => items,
            item => vec![item],
        };

        for event in events {
            if event["event_type"].as_str() != Some("order") {
                continue;
            }
            let token_id = event["asset_id"].as_str().unwrap_or("");
            let display_symbol = self
                .display_map
                .read()
                .get(token_id)
                .cloned()
                .unwrap_or_else(|| token_id.chars().take(16).collect());

            let Some(order) = normalize_clob_order(&event, &display_symbol) else { continue };
            self.stats_order_msgs.fetch_add(1, Ordering::Relaxed);

            match order.status {
                OrderState::Filled => info!(
                    "{} [{display_symbol}] order_filled id={} side={} price={} qty={}",
                    self.log_prefix, order.order_id, order.side, order.price, order.filled_quantity
                ),
                OrderState::Cancelled => info!(
                    "{} [{display_symbol}] order_cancelled id={}",
                    self.log_prefix, order.order_id
                ),
                _ => {}
            }
            self.record_order(order);
        }
    }

    async fn run_stats_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(STATS_LOG_INTERVAL).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let (total, active) = {
                let orders = self.orders.read();
                let active = orders.values().filter(|o| o.is_active()).count();
                (orders.len(), active)
            };
            info!(
                "{} stream_stats tokens={} prices={} orders={total} active={active} \
                 price_updates={} order_msgs={}",
                self.log_prefix,
                self.subscribed_tokens.read().len(),
                self.prices.read().len(),
                self.stats_price_updates.load(Ordering::Relaxed),
                self.stats_order_msgs.load(Ordering::Relaxed),
            );
        }
    }
}

fn str_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
        .filter(|n| *n > 0.0)
}

/// Best price in an L2 ladder: highest bid or lowest ask.
fn best_level(levels: &Value, is_bid: bool) -> Option<f64> {
    let prices = levels
        .as_array()?
        .iter()
        .filter_map(|level| str_f64(&level["price"]));
    if is_bid {
        prices.fold(None, |best: Option<f64>, p| Some(best.map_or(p, |b| b.max(p))))
    } else {
        prices.fold(None, |best: Option<f64>, p| Some(best.map_or(p, |b| b.min(p))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_level_orders_the_ladder() {
        let bids = json!([
            {"price": "0.47", "size": "10"},
            {"price": "0.48", "size": "5"},
            {"price": "0.46", "size": "20"}
        ]);
        assert_eq!(best_level(&bids, true), Some(0.48));
        assert_eq!(best_level(&bids, false), Some(0.46));
        assert_eq!(best_level(&json!([]), true), None);
    }

    #[test]
    fn str_f64_accepts_both_spellings() {
        assert_eq!(str_f64(&json!("0.5")), Some(0.5));
        assert_eq!(str_f64(&json!(0.5)), Some(0.5));
        assert_eq!(str_f64(&json!("zero")), None);
    }
}
