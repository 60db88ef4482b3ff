//! Shared spot/futures stream manager.
//!
//! One instance per (api_key, api_secret, venue, testnet) tuple, reference
//! counted from a process-wide pool. A market socket maintains bid/ask
//! midpoints for the union of every holder's symbols; a user socket keeps
//! the order cache current; REST reconciliation patches whatever the
//! sockets miss. When the venue has an order WebSocket API, the manager
//! also owns that socket: callers submit a request plus a reply channel
//! and await the reply under the sync timeout.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::domain::OrderState;
use crate::exchange::spot_rest::{map_order_status, value_f64, ws_api_url, ws_url, SpotRestClient};
use crate::exchange::{ExchangeError, ExchangeKind, ExchangeOrder, FeeAccounting};

use super::{
    evict_terminal_orders, PRICE_MAX_AGE, RECONCILE_INTERVAL, RECONCILE_INTERVAL_CALLS,
    RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY, STATS_LOG_INTERVAL,
};

const LISTEN_KEY_KEEPALIVE: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// (api_key, api_secret, venue_id, testnet)
type StreamKey = (String, String, String, bool);

#[derive(Debug)]
enum StreamCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// One in-flight order WebSocket request: signed params out, the venue's
/// result routed back through the reply channel.
struct WsApiCall {
    method: &'static str,
    params: Vec<(String, String)>,
    reply: oneshot::Sender<Result<Value, ExchangeError>>,
}

fn pool() -> &'static Mutex<HashMap<StreamKey, (usize, Arc<SpotStreamManager>)>> {
    static POOL: OnceLock<Mutex<HashMap<StreamKey, (usize, Arc<SpotStreamManager>)>>> =
        OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct SpotStreamManager {
    key: StreamKey,
    venue_id: String,
    rest: SpotRestClient,
    ws_base: &'static str,
    ws_api: &'static str,

    prices: RwLock<HashMap<String, (f64, Instant)>>,
    orders: RwLock<HashMap<String, ExchangeOrder>>,
    subscribed: RwLock<HashSet<String>>,

    cmd_tx: mpsc::Sender<StreamCommand>,
    ws_api_tx: mpsc::Sender<WsApiCall>,
    supports_order_writes: bool,
    sync_timeout: Duration,
    running: Arc<AtomicBool>,

    reconcile_state: Mutex<(u64, Option<Instant>)>,
    stats_price_updates: AtomicU64,
    stats_order_msgs: AtomicU64,
}

impl SpotStreamManager {
    /// Fetch or create the shared instance for a credential tuple.
    /// `ws_orders` enables the venue's order WebSocket API; when off, only
    /// the data sockets run and order writes stay on REST.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire(
        kind: ExchangeKind,
        venue_id: &str,
        api_key: &str,
        api_secret: &str,
        testnet: bool,
        rest: SpotRestClient,
        ws_orders: bool,
        sync_timeout: Duration,
    ) -> Arc<Self> {
        let key: StreamKey = (
            api_key.to_string(),
            api_secret.to_string(),
            venue_id.to_string(),
            testnet,
        );
        let mut pool = pool().lock();
        if let Some((ref_count, manager)) = pool.get_mut(&key) {
            if manager.running.load(Ordering::SeqCst) {
                *ref_count += 1;
                debug!("[{venue_id}] reuse stream, ref_count={ref_count}");
                return manager.clone();
            }
            warn!("[{venue_id}] replacing stale stream instance");
            pool.remove(&key);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (ws_api_tx, ws_api_rx) = mpsc::channel(64);
        let manager = Arc::new(Self {
            key: key.clone(),
            venue_id: venue_id.to_string(),
            rest,
            ws_base: ws_url(kind, testnet),
            ws_api: ws_api_url(kind, testnet),
            prices: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(HashSet::new()),
            cmd_tx,
            ws_api_tx,
            supports_order_writes: ws_orders,
            sync_timeout,
            running: Arc::new(AtomicBool::new(true)),
            reconcile_state: Mutex::new((0, None)),
            stats_price_updates: AtomicU64::new(0),
            stats_order_msgs: AtomicU64::new(0),
        });

        manager.spawn_tasks(cmd_rx, ws_api_rx);
        pool.insert(key, (1, manager.clone()));
        info!("[{venue_id}] created stream, ref_count=1 ws_orders={ws_orders}");
        manager
    }

    /// Drop one reference; the last holder tears the sockets down.
    pub fn release(manager: &Arc<Self>) {
        let mut pool = pool().lock();
        let Some((ref_count, _)) = pool.get_mut(&manager.key) else {
            return;
        };
        *ref_count -= 1;
        let remaining = *ref_count;
        debug!("[{}] release stream, ref_count={remaining}", manager.venue_id);
        if remaining == 0 {
            pool.remove(&manager.key);
            manager.running.store(false, Ordering::SeqCst);
            info!("[{}] stream shut down", manager.venue_id);
        }
    }

    pub fn subscribe(&self, symbol: &str) {
        let is_new = self.subscribed.write().insert(symbol.to_string());
        if is_new {
            let _ = self.cmd_tx.try_send(StreamCommand::Subscribe(symbol.to_string()));
        }
        debug!("[{}] subscribed symbol: {symbol}", self.venue_id);
    }

    pub fn unsubscribe(&self, symbol: &str) {
        let was_present = self.subscribed.write().remove(symbol);
        if was_present {
            let _ = self.cmd_tx.try_send(StreamCommand::Unsubscribe(symbol.to_string()));
            self.prices.write().remove(symbol);
        }
        debug!("[{}] unsubscribed symbol: {symbol}", self.venue_id);
    }

    /// Cached midpoint, fresh within [`PRICE_MAX_AGE`].
    pub fn get_price(&self, symbol: &str) -> Option<f64> {
        let prices = self.prices.read();
        let (price, at) = prices.get(symbol)?;
        (at.elapsed() <= PRICE_MAX_AGE).then_some(*price)
    }

    pub fn get_order(&self, order_id: &str) -> Option<ExchangeOrder> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn record_order(&self, order: ExchangeOrder) {
        let mut orders = self.orders.write();
        orders.insert(order.order_id.clone(), order);
        evict_terminal_orders(&mut orders);
    }

    /// Active cached orders for a symbol, with opportunistic reconciliation
    /// against REST (every Nth call or 30 s, whichever comes first).
    pub async fn get_open_orders(&self, symbol: &str) -> Vec<ExchangeOrder> {
        if self.should_reconcile() {
            self.reconcile(symbol).await;
        }
        self.orders
            .read()
            .values()
            .filter(|o| o.symbol.eq_ignore_ascii_case(symbol) && o.is_active())
            .cloned()
            .collect()
    }

    fn should_reconcile(&self) -> bool {
        let mut state = self.reconcile_state.lock();
        state.0 += 1;
        let due = state.0 % RECONCILE_INTERVAL_CALLS == 0
            || state.1.map_or(true, |at| at.elapsed() > RECONCILE_INTERVAL);
        if due {
            state.1 = Some(Instant::now());
        }
        due
    }

    /// Union REST open orders into the cache, then chase every cached
    /// active order REST no longer reports: the venue either reclassifies
    /// it or declares it gone (cancelled).
    async fn reconcile(&self, symbol: &str) {
        let rest_orders = match self.rest.open_orders(symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                debug!("[{}] reconcile fetch failed: {e}", self.venue_id);
                return;
            }
        };

        let rest_ids: HashSet<String> = rest_orders.iter().map(|o| o.order_id.clone()).collect();
        {
            let mut orders = self.orders.write();
            for order in rest_orders {
                orders.insert(order.order_id.clone(), order);
            }
        }

        let stale_ids: Vec<String> = self
            .orders
            .read()
            .values()
            .filter(|o| {
                o.symbol.eq_ignore_ascii_case(symbol)
                    && o.is_active()
                    && !rest_ids.contains(&o.order_id)
            })
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in stale_ids {
            match self.rest.get_order(symbol, &order_id).await {
                Ok(Some(order)) => {
                    self.orders.write().insert(order_id, order);
                }
                Ok(None) => {
                    if let Some(cached) = self.orders.write().get_mut(&order_id) {
                        cached.status = OrderState::Cancelled;
                    }
                    info!(
                        "[{}] reconcile: order {order_id} not found, marked cancelled",
                        self.venue_id
                    );
                }
                Err(ExchangeError::OrderNotFound(_)) => {
                    if let Some(cached) = self.orders.write().get_mut(&order_id) {
                        cached.status = OrderState::Cancelled;
                    }
                }
                Err(e) => {
                    debug!("[{}] reconcile fetch_order {order_id} failed: {e}", self.venue_id);
                }
            }
        }
    }

    /// Whether order writes can go over the venue's order WebSocket.
    pub fn supports_order_writes(&self) -> bool {
        self.supports_order_writes
    }

    /// Submit one order WebSocket request and await the venue's reply,
    /// bounded by the sync timeout.
    pub async fn ws_api_call(
        &self,
        method: &'static str,
        params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        if !self.supports_order_writes {
            return Err(ExchangeError::Venue("venue has no order ws api".into()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.ws_api_tx
            .send(WsApiCall {
                method,
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ExchangeError::Network("order ws task not running".into()))?;

        match tokio::time::timeout(self.sync_timeout, reply_rx).await {
            Err(_) => Err(ExchangeError::Timeout(format!(
                "order ws {method} timed out after {:.1}s",
                self.sync_timeout.as_secs_f64()
            ))),
            Ok(Err(_)) => Err(ExchangeError::Network("order ws reply dropped".into())),
            Ok(Ok(outcome)) => outcome,
        }
    }

    // ==================== socket tasks ====================

    fn spawn_tasks(
        self: &Arc<Self>,
        cmd_rx: mpsc::Receiver<StreamCommand>,
        ws_api_rx: mpsc::Receiver<WsApiCall>,
    ) {
        let market = self.clone();
        tokio::spawn(async move { market.run_market_ws(cmd_rx).await });

        let user = self.clone();
        tokio::spawn(async move { user.run_user_ws().await });

        if self.supports_order_writes {
            let orders = self.clone();
            tokio::spawn(async move { orders.run_order_ws(ws_api_rx).await });
        }

        let stats = self.clone();
        tokio::spawn(async move { stats.run_stats_loop().await });
    }

    /// Order WebSocket loop: send signed request frames, match responses
    /// back to their reply channels by id. A dropped connection fails every
    /// in-flight call; callers fall down their REST ladder.
    async fn run_order_ws(self: Arc<Self>, mut call_rx: mpsc::Receiver<WsApiCall>) {
        let mut delay = RECONNECT_BASE_DELAY;
        let mut next_id: u64 = 1;
        while self.running.load(Ordering::SeqCst) {
            match connect_async(self.ws_api).await {
                Ok((mut ws, _)) => {
                    info!("[{}] order WS connected", self.venue_id);
                    delay = RECONNECT_BASE_DELAY;
                    let mut pending: HashMap<String, oneshot::Sender<Result<Value, ExchangeError>>> =
                        HashMap::new();

                    loop {
                        if !self.running.load(Ordering::SeqCst) {
                            let _ = ws.close(None).await;
                            fail_pending(&mut pending);
                            return;
                        }
                        tokio::select! {
                            call = call_rx.recv() => {
                                let Some(call) = call else {
                                    fail_pending(&mut pending);
                                    return;
                                };
                                let request_id = format!("req-{next_id}");
                                next_id += 1;
                                match self.rest.signed_ws_params(&call.params) {
                                    Ok(params) => {
                                        let frame = json!({
                                            "id": request_id,
                                            "method": call.method,
                                            "params": params,
                                        });
                                        if ws.send(Message::Text(frame.to_string())).await.is_err() {
                                            let _ = call.reply.send(Err(ExchangeError::Network(
                                                "order ws send failed".into(),
                                            )));
                                            break;
                                        }
                                        pending.insert(request_id, call.reply);
                                    }
                                    Err(e) => {
                                        let _ = call.reply.send(Err(e));
                                    }
                                }
                            }
                            frame = ws.next() => {
                                match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Some((id, outcome)) = parse_ws_api_response(&text) {
                                            if let Some(reply) = pending.remove(&id) {
                                                let _ = reply.send(outcome);
                                            }
                                        }
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = ws.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        warn!("[{}] order WS error: {e}", self.venue_id);
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                    fail_pending(&mut pending);
                }
                Err(e) => {
                    warn!("[{}] order WS connect failed: {e}", self.venue_id);
                }
            }

            if self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }

    async fn run_market_ws(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<StreamCommand>) {
        let mut delay = RECONNECT_BASE_DELAY;
        while self.running.load(Ordering::SeqCst) {
            let url = format!("{}/ws", self.ws_base);
            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => {
                    info!("[{}] market WS connected", self.venue_id);
                    delay = RECONNECT_BASE_DELAY;

                    let symbols: Vec<String> = self.subscribed.read().iter().cloned().collect();
                    if !symbols.is_empty() {
                        let _ = ws
                            .send(Message::Text(subscribe_payload(&symbols, true).to_string()))
                            .await;
                    }

                    loop {
                        if !self.running.load(Ordering::SeqCst) {
                            let _ = ws.close(None).await;
                            return;
                        }
                        tokio::select! {
                            command = cmd_rx.recv() => {
                                let Some(command) = command else { return };
                                let (symbols, is_subscribe) = match command {
                                    StreamCommand::Subscribe(s) => (vec![s], true),
                                    StreamCommand::Unsubscribe(s) => (vec![s], false),
                                };
                                if ws
                                    .send(Message::Text(
                                        subscribe_payload(&symbols, is_subscribe).to_string(),
                                    ))
                                    .await
                                    .is_err()
                                {
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
                                        warn!("[{}] market WS error: {e}", self.venue_id);
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("[{}] market WS connect failed: {e}", self.venue_id);
                }
            }

            if self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }

    fn handle_market_message(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else { return };
        // Combined-stream frames wrap the payload in `data`.
        let data = value.get("data").unwrap_or(&value);

        let Some(symbol) = data["s"].as_str() else { return };
        let bid = value_f64(data, &["b"]);
        let ask = value_f64(data, &["a"]);
        if bid <= 0.0 || ask <= 0.0 {
            return;
        }
        let mid = (bid + ask) / 2.0;

        let subscribed = self
            .subscribed
            .read()
            .iter()
            .any(|s| s.eq_ignore_ascii_case(symbol));
        if !subscribed {
            return;
        }

        self.prices
            .write()
            .insert(symbol.to_uppercase(), (mid, Instant::now()));
        self.stats_price_updates.fetch_add(1, Ordering::Relaxed);
    }

    async fn run_user_ws(self: Arc<Self>) {
        let mut delay = RECONNECT_BASE_DELAY;
        while self.running.load(Ordering::SeqCst) {
            let listen_key = match self.rest.create_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    warn!("[{}] listen key request failed: {e}", self.venue_id);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
            };

            let url = format!("{}/ws/{listen_key}", self.ws_base);
            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => {
                    info!("[{}] user WS connected", self.venue_id);
                    delay = RECONNECT_BASE_DELAY;
                    let mut keepalive = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
                    keepalive.tick().await; // first tick fires immediately

                    loop {
                        if !self.running.load(Ordering::SeqCst) {
                            let _ = ws.close(None).await;
                            return;
                        }
                        tokio::select! {
                            _ = keepalive.tick() => {
                                if let Err(e) = self.rest.keepalive_listen_key(&listen_key).await {
                                    warn!("[{}] listen key keepalive failed: {e}", self.venue_id);
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
                                        warn!("[{}] user WS error: {e}", self.venue_id);
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("[{}] user WS connect failed: {e}", self.venue_id);
                }
            }

            if self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }

    fn handle_user_message(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else { return };
        // Spot reports executionReport flat; futures nests the order in `o`.
        let payload = match value["e"].as_str() {
            Some("executionReport") => &value,
            Some("ORDER_TRADE_UPDATE") => &value["o"],
            _ => return,
        };

        let Some(order) = normalize_user_event(payload) else { return };
        self.stats_order_msgs.fetch_add(1, Ordering::Relaxed);

        let subscribed = self
            .subscribed
            .read()
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&order.symbol));
        if !subscribed {
            return;
        }

        match order.status {
            OrderState::Filled => info!(
                "[{}] order_filled id={} side={} price={} qty={}",
                self.venue_id, order.order_id, order.side, order.price, order.filled_quantity
            ),
            OrderState::Cancelled => info!(
                "[{}] order_cancelled id={} side={}",
                self.venue_id, order.order_id, order.side
            ),
            _ => {}
        }

        self.record_order(order);
    }

    async fn run_stats_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(STATS_LOG_INTERVAL).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let (total, active, terminal) = {
                let orders = self.orders.read();
                let active = orders.values().filter(|o| o.is_active()).count();
                (orders.len(), active, orders.len() - active)
            };
            info!(
                "[{}] stream_stats symbols={} prices={} orders_cache={total} active={active} terminal={terminal} \
                 price_updates={} order_msgs={}",
                self.venue_id,
                self.subscribed.read().len(),
                self.prices.read().len(),
                self.stats_price_updates.load(Ordering::Relaxed),
                self.stats_order_msgs.load(Ordering::Relaxed),
            );
        }
    }
}

fn fail_pending(pending: &mut HashMap<String, oneshot::Sender<Result<Value, ExchangeError>>>) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(ExchangeError::Network("order ws disconnected".into())));
    }
}

/// Route an order WebSocket response to `(request id, outcome)`. Status 200
/// yields the result payload; anything else maps onto the error kinds.
fn parse_ws_api_response(text: &str) -> Option<(String, Result<Value, ExchangeError>)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let id = value["id"]
        .as_str()
        .map(str::to_string)
        .or_else(|| value["id"].as_i64().map(|n| n.to_string()))?;

    let status = value["status"].as_i64().unwrap_or(0);
    let outcome = if status == 200 {
        Ok(value["result"].clone())
    } else {
        let message = value["error"]["msg"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("order ws status {status}"));
        if status == 429 || status == 418 {
            Err(ExchangeError::RateLimited(message))
        } else if ExchangeError::text_means_not_found(&message) {
            Err(ExchangeError::OrderNotFound(message))
        } else {
            Err(ExchangeError::Venue(message))
        }
    };
    Some((id, outcome))
}

fn subscribe_payload(symbols: &[String], subscribe: bool) -> Value {
    let params: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@bookTicker", s.to_lowercase()))
        .collect();
    json!({
        "method": if subscribe { "SUBSCRIBE" } else { "UNSUBSCRIBE" },
        "params": params,
        "id": chrono::Utc::now().timestamp_millis(),
    })
}

/// Normalize an executionReport / ORDER_TRADE_UPDATE payload.
fn normalize_user_event(payload: &Value) -> Option<ExchangeOrder> {
    let order_id = payload
        .get("i")
        .and_then(|v| v.as_i64().map(|n| n.to_string()).or_else(|| v.as_str().map(str::to_string)))?;
    let symbol = payload["s"].as_str()?.to_string();
    let side = match payload["S"].as_str().unwrap_or("").to_lowercase().as_str() {
        "sell" => crate::domain::Side::Sell,
        _ => crate::domain::Side::Buy,
    };
    let quantity = value_f64(payload, &["q"]);
    let filled = value_f64(payload, &["z"]);
    let status = map_order_status(payload["X"].as_str().unwrap_or(""), filled, quantity);
    let avg = value_f64(payload, &["ap"]);
    let last_px = value_f64(payload, &["L"]);
    let limit = value_f64(payload, &["p"]);
    let price = if avg > 0.0 {
        avg
    } else if last_px > 0.0 {
        last_px
    } else {
        limit
    };

    let commission_asset = payload["N"].as_str().unwrap_or("");
    let fee_accounting = if !commission_asset.is_empty() && !symbol.ends_with(commission_asset) {
        FeeAccounting::ExternalToken
    } else {
        FeeAccounting::QuoteDeduction
    };

    Some(ExchangeOrder {
        order_id,
        symbol,
        side,
        price,
        quantity,
        filled_quantity: filled,
        status,
        fee: {
            let n = value_f64(payload, &["n"]);
            (n > 0.0).then_some(n)
        },
        fee_accounting,
        token_id: None,
        raw: Some(payload.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_payload_lowercases_streams() {
        let payload = subscribe_payload(&["BTCUSDT".to_string()], true);
        assert_eq!(payload["method"], "SUBSCRIBE");
        assert_eq!(payload["params"][0], "btcusdt@bookTicker");
    }

    #[test]
    fn user_event_normalizes_fill() {
        let payload = json!({
            "e": "executionReport", "s": "BTCUSDT", "S": "BUY", "i": 42,
            "p": "99.5", "q": "0.01", "z": "0.01", "X": "FILLED", "L": "99.5",
            "N": "USDT", "n": "0.0001"
        });
        let order = normalize_user_event(&payload).unwrap();
        assert_eq!(order.order_id, "42");
        assert_eq!(order.status, OrderState::Filled);
        assert!(matches!(order.fee_accounting, FeeAccounting::QuoteDeduction));
        assert_eq!(order.price, 99.5);
    }

    #[test]
    fn bnb_commission_is_external() {
        let payload = json!({
            "e": "executionReport", "s": "BTCUSDT", "S": "BUY", "i": 43,
            "p": "99.5", "q": "0.01", "z": "0.01", "X": "FILLED", "N": "BNB"
        });
        let order = normalize_user_event(&payload).unwrap();
        assert!(matches!(order.fee_accounting, FeeAccounting::ExternalToken));
    }

    #[test]
    fn ws_api_success_routes_result_by_id() {
        let text = json!({
            "id": "req-7",
            "status": 200,
            "result": { "orderId": 42, "status": "NEW" }
        })
        .to_string();
        let (id, outcome) = parse_ws_api_response(&text).unwrap();
        assert_eq!(id, "req-7");
        assert_eq!(outcome.unwrap()["orderId"], json!(42));
    }

    #[test]
    fn ws_api_errors_map_to_kinds() {
        let rejected = json!({
            "id": "req-8",
            "status": 400,
            "error": { "code": -2010, "msg": "Account has insufficient balance." }
        })
        .to_string();
        let (_, outcome) = parse_ws_api_response(&rejected).unwrap();
        assert!(matches!(outcome, Err(ExchangeError::Venue(_))));

        let limited = json!({
            "id": 9,
            "status": 429,
            "error": { "msg": "Too many requests." }
        })
        .to_string();
        let (id, outcome) = parse_ws_api_response(&limited).unwrap();
        assert_eq!(id, "9");
        assert!(matches!(outcome, Err(ExchangeError::RateLimited(_))));

        let gone = json!({
            "id": "req-10",
            "status": 400,
            "error": { "code": -2013, "msg": "Order does not exist." }
        })
        .to_string();
        let (_, outcome) = parse_ws_api_response(&gone).unwrap();
        assert!(matches!(outcome, Err(ExchangeError::OrderNotFound(_))));

        // Frames with no id (e.g. server notices) are dropped.
        assert!(parse_ws_api_response("{\"status\":200}").is_none());
    }
}
