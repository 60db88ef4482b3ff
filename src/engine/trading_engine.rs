//! Per-strategy trading engine: the control loop that keeps a grid of
//! resting orders on the venue, reacts to fills with counter-orders,
//! enforces risk policy and persists every fill.
//!
//! One engine owns one (account, symbol) pair. All engine state lives behind
//! a single mutex; every adapter call happens outside it, so a slow venue
//! never blocks state readers. Stop is cooperative and observed at the top
//! of the loop, around adapter calls and inside every sleep slice.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::domain::{Order, OrderState, PositionEntry, PositionTracker, RingSet, Side};
use crate::exchange::{
    EditOrderRequest, ExchangeAdapter, ExchangeOrder, FeeAccounting, OrderRequest, TradingRules,
};
use crate::notify::NotifyEvent;
use crate::risk::RiskGovernor;
use crate::storage::{TradeRecord, TradeStore};
use crate::strategy::Strategy;

use super::event_bus::{Event, EventBus, EventType};
use super::position_syncer::PositionSyncer;

const PROCESSED_FILL_CAPACITY: usize = 1000;
const STOP_LOSS_RING_CAPACITY: usize = 1000;
const SLEEP_SLICE: Duration = Duration::from_millis(200);
const NO_PRICE_SLEEP: Duration = Duration::from_millis(100);
/// Aggressive limit offsets for stop-loss liquidation.
const STOP_LOSS_SELL_FACTOR: f64 = 0.999;
const STOP_LOSS_BUY_FACTOR: f64 = 1.001;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub strategy_id: i64,
    pub reconcile_interval: Duration,
    pub status_interval: Duration,
    pub error_retain: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy_id: 0,
            reconcile_interval: Duration::from_secs(60),
            status_interval: Duration::from_secs(5),
            error_retain: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderSummary {
    pub price: f64,
    pub quantity: f64,
}

/// Snapshot published to the coordinator after every tick. All numeric
/// fields serialize to base-10 strings at the store boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub exchange: String,
    pub current_price: Option<f64>,
    pub pending_buys: usize,
    pub pending_sells: usize,
    pub position_count: usize,
    pub buy_orders: Vec<OrderSummary>,
    pub sell_orders: Vec<OrderSummary>,
    pub last_error: Option<String>,
    pub extra: serde_json::Map<String, Value>,
}

pub type StatusCallback = Arc<dyn Fn(StatusSnapshot) + Send + Sync>;
pub type NotifyCallback = Arc<dyn Fn(NotifyEvent, String, String) + Send + Sync>;

/// Cooperative stop flag shared between the engine, the OS signal handler
/// and the coordinator stop-watcher.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct EngineState {
    pending_buys: HashMap<String, Order>,
    pending_sells: HashMap<String, Order>,
    current_price: Option<f64>,
    last_error: Option<(String, Instant)>,
}

pub struct TradingEngine {
    config: EngineConfig,
    strategy: Arc<dyn Strategy>,
    adapter: Arc<dyn ExchangeAdapter>,
    risk: Arc<RiskGovernor>,
    trade_store: Option<Arc<TradeStore>>,
    bus: Arc<EventBus>,
    positions: PositionTracker,
    log_prefix: String,

    state: Mutex<EngineState>,
    processed_fill_ids: Mutex<RingSet>,
    stop_loss_fired: Mutex<RingSet>,
    syncer: Mutex<PositionSyncer>,
    rules_cache: Mutex<Option<TradingRules>>,
    fee_cache: Mutex<Option<f64>>,
    last_reconcile: Mutex<Option<Instant>>,
    last_status: Mutex<Option<Instant>>,

    stop_signal: StopSignal,
    stop_logged: AtomicBool,
    stop_ran: AtomicBool,
    loop_running: AtomicBool,
    market_switched: Arc<AtomicBool>,

    on_status: Mutex<Option<StatusCallback>>,
    on_notify: Mutex<Option<NotifyCallback>>,
}

impl TradingEngine {
    pub fn new(
        config: EngineConfig,
        strategy: Arc<dyn Strategy>,
        adapter: Arc<dyn ExchangeAdapter>,
        risk: Arc<RiskGovernor>,
        trade_store: Option<Arc<TradeStore>>,
        log_prefix: String,
        stop_signal: StopSignal,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            config,
            strategy,
            adapter,
            risk,
            trade_store,
            bus: Arc::new(EventBus::new()),
            positions: PositionTracker::new(),
            log_prefix,
            state: Mutex::new(EngineState::default()),
            processed_fill_ids: Mutex::new(RingSet::new(PROCESSED_FILL_CAPACITY)),
            stop_loss_fired: Mutex::new(RingSet::new(STOP_LOSS_RING_CAPACITY)),
            syncer: Mutex::new(PositionSyncer::default()),
            rules_cache: Mutex::new(None),
            fee_cache: Mutex::new(None),
            last_reconcile: Mutex::new(None),
            last_status: Mutex::new(None),
            stop_signal,
            stop_logged: AtomicBool::new(false),
            stop_ran: AtomicBool::new(false),
            loop_running: AtomicBool::new(false),
            market_switched: Arc::new(AtomicBool::new(false)),
            on_status: Mutex::new(None),
            on_notify: Mutex::new(None),
        });

        let flag = engine.market_switched.clone();
        let bus = engine.bus.clone();
        engine.adapter.set_market_switch_listener(Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
            bus.publish(Event::new(EventType::MarketSwitched, json!({})));
        }));

        engine
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.on_status.lock() = Some(callback);
    }

    pub fn set_notify_callback(&self, callback: NotifyCallback) {
        *self.on_notify.lock() = Some(callback);
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn positions(&self) -> &PositionTracker {
        &self.positions
    }

    pub fn pending_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.pending_buys.len(), state.pending_sells.len())
    }

    pub fn pending_orders(&self) -> (Vec<Order>, Vec<Order>) {
        let state = self.state.lock();
        (
            state.pending_buys.values().cloned().collect(),
            state.pending_sells.values().cloned().collect(),
        )
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.as_ref().map(|(msg, _)| msg.clone())
    }

    /// Run the engine to completion. Returns when the stop signal fires or
    /// `stop()` is called.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!("{} engine starting", self.log_prefix);
        self.loop_running.store(true, Ordering::SeqCst);
        self.recover_open_orders().await;

        let mut tick: u64 = 0;
        loop {
            if self.stop_requested() {
                break;
            }
            tick += 1;
            let started = Instant::now();

            if self.market_switched.swap(false, Ordering::SeqCst) {
                self.handle_market_switch();
            }

            let fresh_price = match self.adapter.ticker_price().await {
                Ok(p) if p > 0.0 => Some(p),
                Ok(p) => {
                    self.record_error(format!("ticker returned non-positive price {p}"));
                    None
                }
                Err(e) => {
                    self.record_error(format!("price fetch failed: {e}"));
                    None
                }
            };

            let Some(price) = fresh_price else {
                debug!("{} tick #{tick} waiting for price", self.log_prefix);
                self.publish_status(true);
                if self.sleep_with_stop(NO_PRICE_SLEEP).await {
                    break;
                }
                continue;
            };
            self.state.lock().current_price = Some(price);
            self.bus
                .publish(Event::new(EventType::PriceUpdate, json!({ "price": price })));
            let t_price = started.elapsed();

            self.sync_orders(price).await;
            let t_sync = started.elapsed();

            self.check_new_orders(price).await;
            let t_new = started.elapsed();

            self.check_reprice(price).await;
            let t_reprice = started.elapsed();

            self.check_stop_loss(price).await;
            let t_stop = started.elapsed();

            self.periodic_sync(price).await;
            let t_periodic = started.elapsed();

            self.expire_stale_error();
            self.publish_status(true);

            let (buys, sells) = self.pending_counts();
            info!(
                "{} tick #{tick} price={price} buys={buys} sells={sells} positions={} \
                 | price {:.0}ms sync {:.0}ms open {:.0}ms reprice {:.0}ms stop {:.0}ms periodic {:.0}ms | total {:.0}ms",
                self.log_prefix,
                self.positions.count(),
                t_price.as_secs_f64() * 1000.0,
                (t_sync - t_price).as_secs_f64() * 1000.0,
                (t_new - t_sync).as_secs_f64() * 1000.0,
                (t_reprice - t_new).as_secs_f64() * 1000.0,
                (t_stop - t_reprice).as_secs_f64() * 1000.0,
                (t_periodic - t_stop).as_secs_f64() * 1000.0,
                t_periodic.as_secs_f64() * 1000.0,
            );

            let interval = Duration::from_secs_f64(self.strategy.config().interval.max(0.1));
            if self.sleep_with_stop(interval).await {
                break;
            }
        }

        info!("{} engine loop exited", self.log_prefix);
        self.loop_running.store(false, Ordering::SeqCst);
        self.publish_status(true);
        Ok(())
    }

    /// Cancel everything, clear state, publish a final snapshot and close
    /// the adapter. Safe to call concurrently; only the first call acts.
    pub async fn stop(&self) {
        if self.stop_ran.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} engine stopping", self.log_prefix);
        self.stop_signal.trigger();

        // Let an in-flight tick drain so nothing is placed after the
        // cancel sweep below.
        let quiesce_deadline = Instant::now() + Duration::from_secs(5);
        while self.loop_running.load(Ordering::SeqCst) && Instant::now() < quiesce_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let order_ids: Vec<String> = {
            let state = self.state.lock();
            state
                .pending_buys
                .keys()
                .chain(state.pending_sells.keys())
                .cloned()
                .collect()
        };
        if !order_ids.is_empty() {
            self.adapter.cancel_batch_orders(order_ids).await;
        }

        {
            let mut state = self.state.lock();
            state.pending_buys.clear();
            state.pending_sells.clear();
        }

        self.publish_status(true);
        self.adapter.close().await;
        info!("{} engine stopped", self.log_prefix);
    }

    // ==================== tick steps ====================

    /// First-tick recovery: adopt orders a crashed prior run left on the
    /// venue instead of re-creating them.
    async fn recover_open_orders(&self) {
        let open_orders = match self.adapter.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("{} open-order recovery failed: {e}", self.log_prefix);
                return;
            }
        };
        if open_orders.is_empty() {
            return;
        }

        let mut recovered_buys = 0usize;
        let mut recovered_sells = 0usize;
        let mut state = self.state.lock();
        for ex in open_orders {
            let mut order = Order::new(
                ex.order_id.clone(),
                ex.symbol.clone(),
                ex.side,
                ex.price,
                ex.quantity,
                1,
            )
            .with_state(OrderState::Placed);
            order.filled_quantity = ex.filled_quantity;
            match ex.side {
                Side::Buy => {
                    recovered_buys += 1;
                    state.pending_buys.insert(order.order_id.clone(), order);
                }
                Side::Sell => {
                    recovered_sells += 1;
                    state.pending_sells.insert(order.order_id.clone(), order);
                }
            }
        }
        info!(
            "{} recovered open orders buys={recovered_buys} sells={recovered_sells}",
            self.log_prefix
        );
    }

    /// Reconcile pending orders against the venue, react to fills, and
    /// flush the resulting counter-order batch.
    async fn sync_orders(&self, price: f64) {
        if self.stop_requested() {
            return;
        }
        let open_orders = match self.adapter.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                self.record_error(format!("order sync failed: {e}"));
                return;
            }
        };
        let exchange_map: HashMap<String, ExchangeOrder> = open_orders
            .into_iter()
            .map(|o| (o.order_id.clone(), o))
            .collect();

        let pending_ids: Vec<String> = {
            let state = self.state.lock();
            state
                .pending_buys
                .keys()
                .chain(state.pending_sells.keys())
                .cloned()
                .collect()
        };
        if pending_ids.is_empty() {
            return;
        }

        let Some(rules) = self.rules().await else { return };
        let fee_rate = self.fee_rate().await;

        let mut counter_requests: Vec<OrderRequest> = Vec::new();
        let mut counter_meta: Vec<Order> = Vec::new();

        for order_id in pending_ids {
            let ex = match exchange_map.get(&order_id) {
                Some(o)
                    if o.status.is_terminal() || o.status == OrderState::PartiallyFilled =>
                {
                    o.clone()
                }
                Some(_) => continue,
                None => match self.adapter.get_order(&order_id).await {
                    Ok(Some(o)) => o,
                    // Unknown to the venue right now; the periodic reconcile
                    // debounces before evicting.
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("{} get_order {order_id} failed: {e}", self.log_prefix);
                        continue;
                    }
                },
            };

            match ex.status {
                OrderState::Filled => {
                    let popped = {
                        let mut state = self.state.lock();
                        state
                            .pending_buys
                            .remove(&order_id)
                            .or_else(|| state.pending_sells.remove(&order_id))
                    };
                    let Some(mut order) = popped else { continue };

                    if order.related_order_id.is_none() {
                        self.handle_open_filled(
                            &mut order,
                            &ex,
                            price,
                            fee_rate,
                            &rules,
                            &mut counter_requests,
                            &mut counter_meta,
                        );
                    } else {
                        self.handle_close_filled(order, &ex, fee_rate);
                    }
                }
                OrderState::Cancelled => {
                    let mut state = self.state.lock();
                    state.pending_buys.remove(&order_id);
                    state.pending_sells.remove(&order_id);
                    drop(state);
                    info!("{} order cancelled: {order_id}", self.log_prefix);
                    self.bus.publish(Event::new(
                        EventType::OrderCancelled,
                        json!({ "order_id": order_id }),
                    ));
                }
                OrderState::PartiallyFilled => {
                    let delta_info = {
                        let mut guard = self.state.lock();
                        let state = &mut *guard;
                        let entry = if state.pending_buys.contains_key(&order_id) {
                            state.pending_buys.get_mut(&order_id)
                        } else {
                            state.pending_sells.get_mut(&order_id)
                        };
                        entry.and_then(|order| {
                            let previous = order.filled_quantity;
                            order.update_fill(ex.filled_quantity, ex.price);
                            let delta = ex.filled_quantity - previous;
                            (delta > 0.0).then(|| (order.clone(), delta))
                        })
                    };
                    if let Some((order, delta)) = delta_info {
                        self.save_trade(&order, ex.price, None, Some(delta), ex.raw.clone(), fee_rate);
                        self.bus.publish(Event::new(
                            EventType::OrderPartiallyFilled,
                            json!({ "order_id": order.order_id, "delta": delta }),
                        ));
                    }
                }
                OrderState::Failed => {
                    let mut state = self.state.lock();
                    state.pending_buys.remove(&order_id);
                    state.pending_sells.remove(&order_id);
                    drop(state);
                    warn!("{} order failed on venue: {order_id}", self.log_prefix);
                }
                OrderState::Pending | OrderState::Placed => {}
            }
        }

        if !counter_requests.is_empty() {
            self.flush_counter_batch(counter_requests, counter_meta).await;
        }
    }

    /// An opening order filled: record the trade, track the position, and
    /// queue the paired counter-order for the end-of-reconcile batch.
    #[allow(clippy::too_many_arguments)]
    fn handle_open_filled(
        &self,
        order: &mut Order,
        ex: &ExchangeOrder,
        current_price: f64,
        fee_rate: f64,
        rules: &TradingRules,
        counter_requests: &mut Vec<OrderRequest>,
        counter_meta: &mut Vec<Order>,
    ) {
        order.update_fill(ex.filled_quantity, ex.price);
        let filled_price = ex.price;
        let fee_external = matches!(ex.fee_accounting, FeeAccounting::ExternalToken);

        self.save_trade(order, filled_price, None, None, ex.raw.clone(), fee_rate);
        self.positions.add(
            &order.order_id,
            &order.symbol,
            order.filled_quantity,
            filled_price,
            order.grid_index,
        );
        self.bus.publish(Event::new(
            EventType::OrderFilled,
            json!({ "order_id": order.order_id, "side": order.side.as_str(), "price": filled_price }),
        ));
        self.bus
            .publish(Event::new(EventType::PositionChanged, json!({ "count": self.positions.count() })));

        let decision = match order.side {
            Side::Buy => self
                .strategy
                .sell_for(filled_price, order.filled_quantity, current_price),
            Side::Sell => self
                .strategy
                .close_short_for(filled_price, order.filled_quantity, current_price),
        };

        if let Some(decision) = decision {
            // An externally-debited fee never shrinks the counter-order; a
            // quote-debited fee shrinks the long-side sell.
            let counter_qty = if fee_external || order.side == Side::Sell {
                order.filled_quantity
            } else {
                order.filled_quantity * (1.0 - fee_rate)
            };
            let aligned_price = rules.align_price(decision.price);
            let aligned_qty = rules.align_quantity(counter_qty);
            if aligned_price > 0.0 && aligned_qty > 0.0 {
                let request = annotate_close(
                    OrderRequest::new(order.side.opposite(), aligned_price, aligned_qty),
                    order.grid_index,
                );
                counter_requests.push(request);
                counter_meta.push(order.clone());
            } else {
                warn!(
                    "{} counter-order for {} degenerates after alignment, skipped",
                    self.log_prefix, order.order_id
                );
            }
        }

        info!(
            "{} open filled: {} price={filled_price} qty={} fee_external={fee_external}",
            self.log_prefix, order.order_id, order.filled_quantity
        );
        self.emit_notify(
            NotifyEvent::OrderFilled,
            format!("open filled #{}", order.grid_index),
            format!("price: {filled_price}, qty: {}", order.filled_quantity),
        );
    }

    /// A closing order filled: realize pnl, drop the position, persist.
    fn handle_close_filled(&self, mut order: Order, ex: &ExchangeOrder, fee_rate: f64) {
        if !self.processed_fill_ids.lock().insert(order.order_id.clone()) {
            warn!(
                "{} duplicate close fill ignored: {}",
                self.log_prefix, order.order_id
            );
            return;
        }

        order.update_fill(ex.filled_quantity, ex.price);
        let filled_price = ex.price;

        let position = order
            .related_order_id
            .as_deref()
            .and_then(|id| self.positions.remove(id));
        let pnl = position.as_ref().map(|p| {
            if p.is_short() {
                (p.entry_price - filled_price) * order.filled_quantity
            } else {
                (filled_price - p.entry_price) * order.filled_quantity
            }
        });
        if let Some(pnl) = pnl {
            self.risk.record_trade_result(pnl);
        }

        self.save_trade(&order, filled_price, pnl, None, ex.raw.clone(), fee_rate);
        self.bus.publish(Event::new(
            EventType::OrderFilled,
            json!({ "order_id": order.order_id, "side": order.side.as_str(), "pnl": pnl }),
        ));
        self.bus
            .publish(Event::new(EventType::PositionChanged, json!({ "count": self.positions.count() })));

        info!(
            "{} close filled: {} price={filled_price} pnl={:?}",
            self.log_prefix, order.order_id, pnl
        );
        let pnl_str = pnl.map_or("n/a".to_string(), |p| format!("{p:+.6}"));
        self.emit_notify(
            NotifyEvent::OrderFilled,
            format!("close filled #{}", order.grid_index),
            format!("price: {filled_price}, pnl: {pnl_str}"),
        );
    }

    /// Place the queued counter-orders in one batch and install the fills'
    /// paired closers into the pending maps.
    async fn flush_counter_batch(&self, requests: Vec<OrderRequest>, meta: Vec<Order>) {
        debug!("{} placing counter batch count={}", self.log_prefix, requests.len());
        let results = self.adapter.place_batch_orders(requests.clone()).await;

        let mut latest_error: Option<String> = None;
        let mut all_suppressed = true;
        {
            let mut state = self.state.lock();
            for (idx, result) in results.iter().enumerate() {
                let opener = &meta[idx];
                let request = &requests[idx];
                if result.success {
                    if let Some(order_id) = &result.order_id {
                        let placed_price = result.placed_price.unwrap_or(request.price);
                        let placed_qty = result.placed_quantity.unwrap_or(request.quantity);
                        let order = Order::new(
                            order_id.clone(),
                            opener.symbol.clone(),
                            request.side,
                            placed_price,
                            placed_qty,
                            opener.grid_index,
                        )
                        .with_state(OrderState::Placed)
                        .with_related(opener.order_id.clone());
                        match request.side {
                            Side::Buy => state.pending_buys.insert(order_id.clone(), order),
                            Side::Sell => state.pending_sells.insert(order_id.clone(), order),
                        };
                        info!(
                            "{} counter placed: {order_id} price={placed_price} qty={placed_qty}",
                            self.log_prefix
                        );
                        continue;
                    }
                }
                let error = result.error.clone().unwrap_or_else(|| "order rejected".into());
                latest_error = Some(format!("counter-order failed: {error}"));
                if !result.suppress_notify {
                    all_suppressed = false;
                }
                warn!(
                    "{} counter-order failed opener={} error={error}",
                    self.log_prefix, opener.order_id
                );
            }
        }

        if let Some(error) = latest_error {
            self.record_error(error.clone());
            if !all_suppressed {
                self.emit_notify(NotifyEvent::OrderFailed, "counter-order failed".into(), error);
            }
        }
    }

    /// Ask the risk governor and the strategy for new opening orders on both
    /// sides, and submit them as one batch.
    async fn check_new_orders(&self, price: f64) {
        if self.stop_requested() {
            return;
        }
        let (long_opens, long_closes, short_opens, short_closes) = self.partition_pending();
        let positions = self.positions.all();

        let (can_open, reason) = self.risk.can_open_position(positions.len());
        if !can_open {
            debug!("{} opens blocked: {reason}", self.log_prefix);
            return;
        }

        let long_positions: Vec<PositionEntry> =
            positions.iter().filter(|p| p.grid_index > 0).cloned().collect();
        let short_positions: Vec<PositionEntry> =
            positions.iter().filter(|p| p.grid_index < 0).cloned().collect();

        let mut decisions =
            self.strategy
                .buy_batch(price, &long_opens, &long_closes, &long_positions);
        decisions.extend(self.strategy.short_batch(
            price,
            &short_opens,
            &short_closes,
            &short_positions,
        ));
        if decisions.is_empty() {
            return;
        }

        let Some(rules) = self.rules().await else { return };

        let mut requests: Vec<OrderRequest> = Vec::new();
        let mut request_meta: Vec<(i32, f64, f64)> = Vec::new();
        for decision in &decisions {
            let aligned_price = rules.align_price(decision.price);
            let aligned_qty = rules.align_quantity(decision.quantity);
            if aligned_price <= 0.0 || aligned_qty <= 0.0 {
                continue;
            }
            if !rules.meets_min_notional(aligned_price, aligned_qty) {
                debug!(
                    "{} grid {} below min notional, skipped",
                    self.log_prefix, decision.grid_index
                );
                continue;
            }
            requests.push(annotate_open(
                OrderRequest::new(decision.side, aligned_price, aligned_qty),
                decision.grid_index,
            ));
            request_meta.push((decision.grid_index, aligned_price, aligned_qty));
        }
        if requests.is_empty() {
            return;
        }

        debug!("{} placing open batch count={}", self.log_prefix, requests.len());
        let results = self.adapter.place_batch_orders(requests.clone()).await;

        let symbol = self.strategy.config().symbol.clone();
        let mut latest_error: Option<String> = None;
        let mut all_suppressed = true;
        {
            let mut state = self.state.lock();
            for (idx, result) in results.iter().enumerate() {
                let (grid_index, aligned_price, aligned_qty) = request_meta[idx];
                let side = requests[idx].side;
                if result.success {
                    if let Some(order_id) = &result.order_id {
                        let placed_price = result.placed_price.unwrap_or(aligned_price);
                        let placed_qty = result.placed_quantity.unwrap_or(aligned_qty);
                        let order = Order::new(
                            order_id.clone(),
                            symbol.clone(),
                            side,
                            placed_price,
                            placed_qty,
                            grid_index,
                        )
                        .with_state(OrderState::Placed);
                        match side {
                            Side::Buy => state.pending_buys.insert(order_id.clone(), order),
                            Side::Sell => state.pending_sells.insert(order_id.clone(), order),
                        };
                        info!(
                            "{} open placed: {order_id} price={placed_price} qty={placed_qty} grid={grid_index}",
                            self.log_prefix
                        );
                        self.bus.publish(Event::new(
                            EventType::OrderPlaced,
                            json!({ "order_id": order_id, "grid_index": grid_index }),
                        ));
                        continue;
                    }
                }
                let error = result.error.clone().unwrap_or_else(|| "order rejected".into());
                latest_error = Some(format!("open order failed: {error}"));
                if !result.suppress_notify {
                    all_suppressed = false;
                }
                warn!(
                    "{} open order failed price={aligned_price} qty={aligned_qty} error={error}",
                    self.log_prefix
                );
            }
        }

        if let Some(error) = latest_error {
            self.record_error(error.clone());
            if !all_suppressed {
                self.emit_notify(NotifyEvent::OrderFailed, "open order failed".into(), error);
            }
        }
    }

    /// Aggregate every drifted order into one batch edit. A failed edit
    /// leaves the rung unpaired on purpose; the periodic repair re-places it.
    async fn check_reprice(&self, price: f64) {
        if self.stop_requested() {
            return;
        }
        let snapshot: Vec<Order> = {
            let state = self.state.lock();
            state
                .pending_buys
                .values()
                .chain(state.pending_sells.values())
                .cloned()
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let Some(rules) = self.rules().await else { return };

        let mut edits: Vec<EditOrderRequest> = Vec::new();
        let mut edit_meta: Vec<Order> = Vec::new();
        for order in snapshot {
            let target = if order.grid_index >= 0 {
                self.strategy
                    .reprice(order.price, price, order.side == Side::Buy, order.grid_index.max(1))
            } else if order.related_order_id.is_none() {
                self.strategy.reprice_short(order.price, price, order.grid_index)
            } else {
                None
            };
            let Some(target) = target else { continue };

            let aligned = rules.align_price(target);
            if aligned <= 0.0 || (aligned - order.price).abs() < f64::EPSILON {
                continue;
            }
            edits.push(EditOrderRequest {
                order_id: order.order_id.clone(),
                side: order.side,
                price: aligned,
                quantity: order.quantity,
            });
            edit_meta.push(order);
        }
        if edits.is_empty() {
            return;
        }

        debug!("{} repricing count={}", self.log_prefix, edits.len());
        let results = self.adapter.edit_batch_orders(edits.clone()).await;

        let mut state = self.state.lock();
        for (idx, result) in results.iter().enumerate() {
            let old = &edit_meta[idx];
            let new_price = edits[idx].price;

            match old.side {
                Side::Buy => state.pending_buys.remove(&old.order_id),
                Side::Sell => state.pending_sells.remove(&old.order_id),
            };

            if result.success {
                if let Some(new_id) = &result.order_id {
                    let mut order = Order::new(
                        new_id.clone(),
                        old.symbol.clone(),
                        old.side,
                        new_price,
                        old.quantity,
                        old.grid_index,
                    )
                    .with_state(OrderState::Placed);
                    order.related_order_id = old.related_order_id.clone();
                    match old.side {
                        Side::Buy => state.pending_buys.insert(new_id.clone(), order),
                        Side::Sell => state.pending_sells.insert(new_id.clone(), order),
                    };
                    info!(
                        "{} repriced [{}] {} -> {new_id} price={new_price}",
                        self.log_prefix, old.side, old.order_id
                    );
                    continue;
                }
            }
            warn!(
                "{} reprice failed [{}] {} error={:?}, rung lost until repair",
                self.log_prefix,
                old.side,
                old.order_id,
                result.error
            );
        }
    }

    /// One-shot stop-loss per position: cancel the paired closer and fire an
    /// aggressive limit sized to the position.
    async fn check_stop_loss(&self, price: f64) {
        if self.stop_requested() {
            return;
        }
        let positions = self.positions.all();
        if positions.is_empty() {
            return;
        }

        let mut triggered: Vec<(PositionEntry, String)> = Vec::new();
        {
            let mut fired = self.stop_loss_fired.lock();
            for position in positions {
                if fired.contains(&position.order_id) {
                    continue;
                }
                if let Some(reason) = self.risk.check_stop_loss(
                    position.entry_price,
                    price,
                    position.is_short(),
                    position.created_at,
                ) {
                    fired.insert(position.order_id.clone());
                    triggered.push((position, reason));
                }
            }
        }

        for (position, reason) in triggered {
            self.execute_stop_loss(&position, &reason, price).await;
        }
    }

    async fn execute_stop_loss(&self, position: &PositionEntry, reason: &str, price: f64) {
        warn!(
            "{} stop-loss triggered: {} reason={reason}",
            self.log_prefix, position.order_id
        );
        self.emit_notify(
            NotifyEvent::StopLossTriggered,
            "stop-loss triggered".into(),
            format!("position: {}, reason: {reason}", position.order_id),
        );

        let cancel_ids: Vec<String> = {
            let mut state = self.state.lock();
            let matching: Vec<String> = state
                .pending_buys
                .values()
                .chain(state.pending_sells.values())
                .filter(|o| o.related_order_id.as_deref() == Some(position.order_id.as_str()))
                .map(|o| o.order_id.clone())
                .collect();
            for id in &matching {
                state.pending_buys.remove(id);
                state.pending_sells.remove(id);
            }
            matching
        };
        if !cancel_ids.is_empty() {
            self.adapter.cancel_batch_orders(cancel_ids).await;
        }

        let Some(rules) = self.rules().await else { return };
        let (side, raw_price) = if position.is_short() {
            (Side::Buy, price * STOP_LOSS_BUY_FACTOR)
        } else {
            (Side::Sell, price * STOP_LOSS_SELL_FACTOR)
        };
        let stop_price = rules.align_price(raw_price);
        let stop_qty = rules.align_quantity(position.quantity);
        if stop_qty <= 0.0 {
            warn!(
                "{} stop-loss quantity degenerates for {}, skipped",
                self.log_prefix, position.order_id
            );
            return;
        }

        let request = annotate_close(
            OrderRequest::new(side, stop_price, stop_qty),
            position.grid_index,
        );
        let results = self.adapter.place_batch_orders(vec![request]).await;
        match results.first() {
            Some(result) if result.success => {
                info!(
                    "{} stop-loss order placed: {:?}",
                    self.log_prefix, result.order_id
                );
            }
            Some(result) => {
                self.record_error(format!(
                    "stop-loss order failed: {}",
                    result.error.clone().unwrap_or_default()
                ));
            }
            None => {}
        }
    }

    /// Every reconcile interval: debounce missing orders, re-place counter
    /// orders for unpaired positions, cancel orphaned counter orders.
    async fn periodic_sync(&self, price: f64) {
        if self.stop_requested() {
            return;
        }
        {
            let mut last = self.last_reconcile.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.config.reconcile_interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let open_orders = match self.adapter.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                debug!("{} periodic reconcile fetch failed: {e}", self.log_prefix);
                return;
            }
        };
        let exchange_ids: HashSet<String> =
            open_orders.iter().map(|o| o.order_id.clone()).collect();

        let tracked: Vec<String> = {
            let state = self.state.lock();
            state
                .pending_buys
                .keys()
                .chain(state.pending_sells.keys())
                .cloned()
                .collect()
        };

        // An empty venue response against a non-empty book smells like a
        // degraded cache; skip rather than mass-evict.
        if exchange_ids.is_empty() && !tracked.is_empty() {
            warn!("{} venue returned no open orders, skipping reconcile", self.log_prefix);
            return;
        }

        let evicted = self.syncer.lock().observe_missing(&tracked, &exchange_ids);
        if !evicted.is_empty() {
            let mut state = self.state.lock();
            for id in &evicted {
                state.pending_buys.remove(id);
                state.pending_sells.remove(id);
            }
            info!(
                "{} evicted {} orders missing from venue: {evicted:?}",
                self.log_prefix,
                evicted.len()
            );
        }

        self.repair_positions_and_orders(price).await;

        debug!(
            "{} periodic sync done positions={} stop_loss_fired={} processed_fills={}",
            self.log_prefix,
            self.positions.count(),
            self.stop_loss_fired.lock().len(),
            self.processed_fill_ids.lock().len(),
        );
    }

    async fn repair_positions_and_orders(&self, price: f64) {
        let positions = self.positions.all();
        let pending_closes = self.pending_closes();

        let unpaired = PositionSyncer::positions_without_closes(&positions, &pending_closes);
        if !unpaired.is_empty() {
            let Some(rules) = self.rules().await else { return };
            let fee_rate = self.fee_rate().await;

            let mut requests: Vec<OrderRequest> = Vec::new();
            let mut meta: Vec<PositionEntry> = Vec::new();
            for position in unpaired {
                let decision = if position.is_short() {
                    self.strategy
                        .close_short_for(position.entry_price, position.quantity, price)
                } else {
                    self.strategy
                        .sell_for(position.entry_price, position.quantity, price)
                };
                let Some(decision) = decision else { continue };

                let fee_external = match self.adapter.get_order(&position.order_id).await {
                    Ok(Some(ex)) => matches!(ex.fee_accounting, FeeAccounting::ExternalToken),
                    _ => false,
                };
                let qty = if fee_external || position.is_short() {
                    position.quantity
                } else {
                    position.quantity * (1.0 - fee_rate)
                };
                let aligned_price = rules.align_price(decision.price);
                let aligned_qty = rules.align_quantity(qty);
                if aligned_price <= 0.0 || aligned_qty <= 0.0 {
                    continue;
                }
                requests.push(annotate_close(
                    OrderRequest::new(decision.side, aligned_price, aligned_qty),
                    position.grid_index,
                ));
                meta.push(position);
            }

            if !requests.is_empty() {
                debug!("{} repairing counter orders count={}", self.log_prefix, requests.len());
                let results = self.adapter.place_batch_orders(requests.clone()).await;
                let mut latest_error: Option<String> = None;
                let mut state = self.state.lock();
                for (idx, result) in results.iter().enumerate() {
                    let position = &meta[idx];
                    let request = &requests[idx];
                    if result.success {
                        if let Some(order_id) = &result.order_id {
                            let placed_price = result.placed_price.unwrap_or(request.price);
                            let placed_qty = result.placed_quantity.unwrap_or(request.quantity);
                            let order = Order::new(
                                order_id.clone(),
                                position.symbol.clone(),
                                request.side,
                                placed_price,
                                placed_qty,
                                position.grid_index,
                            )
                            .with_state(OrderState::Placed)
                            .with_related(position.order_id.clone());
                            match request.side {
                                Side::Buy => state.pending_buys.insert(order_id.clone(), order),
                                Side::Sell => state.pending_sells.insert(order_id.clone(), order),
                            };
                            info!(
                                "{} repair counter placed: {order_id} price={placed_price} qty={placed_qty}",
                                self.log_prefix
                            );
                            continue;
                        }
                    }
                    let error = result.error.clone().unwrap_or_else(|| "order rejected".into());
                    latest_error = Some(format!("repair counter-order failed: {error}"));
                    warn!(
                        "{} repair counter-order failed position={} error={error}",
                        self.log_prefix, position.order_id
                    );
                }
                drop(state);
                if let Some(error) = latest_error {
                    self.record_error(error);
                }
            }
        }

        let positions = self.positions.all();
        let pending_closes = self.pending_closes();
        let orphans = PositionSyncer::orphan_counter_orders(&positions, &pending_closes);
        if orphans.is_empty() {
            return;
        }
        let orphan_ids: Vec<String> = orphans.iter().map(|o| o.order_id.clone()).collect();
        info!("{} cancelling {} orphan counter orders", self.log_prefix, orphan_ids.len());
        self.adapter.cancel_batch_orders(orphan_ids.clone()).await;
        let mut state = self.state.lock();
        for id in orphan_ids {
            state.pending_buys.remove(&id);
            state.pending_sells.remove(&id);
        }
    }

    // ==================== helpers ====================

    fn handle_market_switch(&self) {
        info!("{} market switched, clearing per-contract state", self.log_prefix);
        {
            let mut state = self.state.lock();
            state.pending_buys.clear();
            state.pending_sells.clear();
        }
        self.positions.clear();
        self.processed_fill_ids.lock().clear();
        self.stop_loss_fired.lock().clear();
        self.syncer.lock().clear();
        self.publish_status(true);
    }

    /// Long opens, long closes, short opens, short closes — partitioned by
    /// map and grid-index sign.
    fn partition_pending(
        &self,
    ) -> (
        HashMap<String, Order>,
        HashMap<String, Order>,
        HashMap<String, Order>,
        HashMap<String, Order>,
    ) {
        let state = self.state.lock();
        let mut long_opens = HashMap::new();
        let mut long_closes = HashMap::new();
        let mut short_opens = HashMap::new();
        let mut short_closes = HashMap::new();

        for (id, order) in &state.pending_buys {
            if order.grid_index < 0 {
                short_closes.insert(id.clone(), order.clone());
            } else {
                long_opens.insert(id.clone(), order.clone());
            }
        }
        for (id, order) in &state.pending_sells {
            if order.grid_index < 0 {
                short_opens.insert(id.clone(), order.clone());
            } else {
                long_closes.insert(id.clone(), order.clone());
            }
        }
        (long_opens, long_closes, short_opens, short_closes)
    }

    fn pending_closes(&self) -> HashMap<String, Order> {
        let (_, long_closes, _, short_closes) = self.partition_pending();
        long_closes.into_iter().chain(short_closes).collect()
    }

    async fn rules(&self) -> Option<TradingRules> {
        if let Some(rules) = *self.rules_cache.lock() {
            return Some(rules);
        }
        match self.adapter.trading_rules().await {
            Ok(rules) => {
                *self.rules_cache.lock() = Some(rules);
                Some(rules)
            }
            Err(e) => {
                self.record_error(format!("trading rules unavailable: {e}"));
                None
            }
        }
    }

    async fn fee_rate(&self) -> f64 {
        if let Some(rate) = *self.fee_cache.lock() {
            return rate;
        }
        match self.adapter.fee_rate().await {
            Ok(rate) => {
                *self.fee_cache.lock() = Some(rate);
                rate
            }
            Err(e) => {
                debug!("{} fee rate unavailable, using 0: {e}", self.log_prefix);
                0.0
            }
        }
    }

    fn save_trade(
        &self,
        order: &Order,
        price: f64,
        pnl: Option<f64>,
        quantity_override: Option<f64>,
        raw: Option<Value>,
        fee_rate: f64,
    ) {
        let Some(store) = &self.trade_store else { return };
        let quantity = quantity_override.unwrap_or(order.filled_quantity);
        let record = TradeRecord {
            id: None,
            strategy_id: self.config.strategy_id,
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side.as_str().to_string(),
            price,
            quantity,
            fee: quantity * price * fee_rate,
            pnl,
            grid_index: order.grid_index,
            related_order_id: order.related_order_id.clone(),
            raw_order_info: raw,
            created_at: Utc::now(),
        };
        // A lost trade record must not stall the engine.
        if let Err(e) = store.save(&record) {
            warn!("{} trade persist failed for {}: {e}", self.log_prefix, order.order_id);
        }
    }

    fn record_error(&self, message: String) {
        warn!("{} {message}", self.log_prefix);
        self.state.lock().last_error = Some((message, Instant::now()));
        self.publish_status(true);
    }

    fn expire_stale_error(&self) {
        let mut state = self.state.lock();
        if let Some((_, at)) = &state.last_error {
            if at.elapsed() > self.config.error_retain {
                state.last_error = None;
            }
        }
    }

    fn emit_notify(&self, event: NotifyEvent, title: String, body: String) {
        let callback = self.on_notify.lock().clone();
        if let Some(callback) = callback {
            callback(event, title, body);
        }
    }

    fn publish_status(&self, force: bool) {
        let callback = self.on_status.lock().clone();
        let Some(callback) = callback else { return };

        {
            let mut last = self.last_status.lock();
            if !force {
                if let Some(at) = *last {
                    if at.elapsed() < self.config.status_interval {
                        return;
                    }
                }
            }
            *last = Some(Instant::now());
        }

        let (current_price, pending_buys, pending_sells, buy_orders, sell_orders, last_error) = {
            let state = self.state.lock();
            (
                state.current_price,
                state.pending_buys.len(),
                state.pending_sells.len(),
                state
                    .pending_buys
                    .values()
                    .map(|o| OrderSummary { price: o.price, quantity: o.quantity })
                    .collect(),
                state
                    .pending_sells
                    .values()
                    .map(|o| OrderSummary { price: o.price, quantity: o.quantity })
                    .collect(),
                state.last_error.as_ref().map(|(msg, _)| msg.clone()),
            )
        };

        let mut extra = serde_json::Map::new();
        if let Some(price) = current_price {
            for (key, value) in self.strategy.status_extra(price) {
                extra.insert(key, value);
            }
        }
        for (key, value) in self.adapter.status_extra() {
            extra.insert(key, value);
        }
        if let Ok(risk) = serde_json::to_value(self.risk.status()) {
            extra.insert("risk".to_string(), risk);
        }

        callback(StatusSnapshot {
            exchange: self.adapter.exchange_info().id,
            current_price,
            pending_buys,
            pending_sells,
            position_count: self.positions.count(),
            buy_orders,
            sell_orders,
            last_error,
            extra,
        });
    }

    fn stop_requested(&self) -> bool {
        let stopped = self.stop_signal.is_triggered() || self.stop_ran.load(Ordering::SeqCst);
        if stopped && !self.stop_logged.swap(true, Ordering::SeqCst) {
            info!("{} stop signal observed, leaving loop", self.log_prefix);
            self.publish_status(true);
        }
        stopped
    }

    /// Chunked sleep honouring the stop probe. Returns true when the stop
    /// was observed.
    async fn sleep_with_stop(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.stop_requested() {
                return true;
            }
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
        self.stop_requested()
    }

}

fn annotate_open(request: OrderRequest, grid_index: i32) -> OrderRequest {
    let side = if grid_index < 0 { "SHORT" } else { "LONG" };
    request.with_param("positionSide", side)
}

fn annotate_close(request: OrderRequest, grid_index: i32) -> OrderRequest {
    let side = if grid_index < 0 { "SHORT" } else { "LONG" };
    request
        .with_param("positionSide", side)
        .with_param("reduceOnly", "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_latches() {
        let signal = StopSignal::new();
        assert!(!signal.is_triggered());
        signal.trigger();
        assert!(signal.is_triggered());
        let clone = signal.clone();
        assert!(clone.is_triggered());
    }

    #[test]
    fn open_annotations_follow_grid_sign() {
        let long = annotate_open(OrderRequest::new(Side::Buy, 1.0, 1.0), 2);
        assert_eq!(long.params.get("positionSide").map(String::as_str), Some("LONG"));
        assert!(!long.params.contains_key("reduceOnly"));

        let short = annotate_close(OrderRequest::new(Side::Buy, 1.0, 1.0), -1);
        assert_eq!(short.params.get("positionSide").map(String::as_str), Some("SHORT"));
        assert_eq!(short.params.get("reduceOnly").map(String::as_str), Some("true"));
    }
}
