//! End-to-end engine scenarios against a scripted venue.
//!
//! The mock adapter keeps a venue-side order book in memory; tests fill,
//! vanish or reject orders and watch the engine react over real ticks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use gridbot::domain::{OrderState, Side};
use gridbot::engine::{EngineConfig, StopSignal, TradingEngine};
use gridbot::exchange::{
    EditOrderRequest, ExchangeAdapter, ExchangeError, ExchangeInfo, ExchangeKind, ExchangeOrder,
    FeeAccounting, OrderRequest, OrderResult, TradingRules,
};
use gridbot::risk::{RiskConfig, RiskGovernor};
use gridbot::runtime::CoordinatorStore;
use gridbot::runtime::RunningInfo;
use gridbot::storage::TradeStore;
use gridbot::strategy::{build_strategy, StrategyConfig, StrategyKind};

// ==================== mock venue ====================

#[derive(Default)]
struct MockVenueState {
    orders: HashMap<String, ExchangeOrder>,
    market_switch_listener: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct MockAdapter {
    symbol: String,
    price: Mutex<f64>,
    state: Mutex<MockVenueState>,
    next_id: AtomicU64,
    fee_accounting: Mutex<FeeAccounting>,
}

impl MockAdapter {
    fn new(symbol: &str, price: f64) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.to_string(),
            price: Mutex::new(price),
            state: Mutex::new(MockVenueState::default()),
            next_id: AtomicU64::new(1),
            fee_accounting: Mutex::new(FeeAccounting::QuoteDeduction),
        })
    }

    fn set_price(&self, price: f64) {
        *self.price.lock() = price;
    }

    fn set_fee_accounting(&self, accounting: FeeAccounting) {
        *self.fee_accounting.lock() = accounting;
    }

    fn venue_orders(&self) -> Vec<ExchangeOrder> {
        self.state.lock().orders.values().cloned().collect()
    }

    fn active_orders(&self) -> Vec<ExchangeOrder> {
        self.venue_orders().into_iter().filter(|o| o.is_active()).collect()
    }

    fn active_orders_of_side(&self, side: Side) -> Vec<ExchangeOrder> {
        self.active_orders().into_iter().filter(|o| o.side == side).collect()
    }

    /// Mark an order fully filled at a price.
    fn fill_order(&self, order_id: &str, price: f64) {
        let accounting = *self.fee_accounting.lock();
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(order_id) {
            order.filled_quantity = order.quantity;
            order.price = price;
            order.status = OrderState::Filled;
            order.fee_accounting = accounting;
        }
    }

    fn partial_fill_order(&self, order_id: &str, filled: f64, price: f64) {
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(order_id) {
            order.filled_quantity = filled;
            order.price = price;
            order.status = OrderState::PartiallyFilled;
        }
    }

    /// Simulate an order silently vanishing from the venue.
    fn vanish_order(&self, order_id: &str) {
        self.state.lock().orders.remove(order_id);
    }

    /// Seed an active order directly onto the venue book.
    fn inject_order(&self, side: Side, price: f64, quantity: f64) -> String {
        let id = format!("seed-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let order = ExchangeOrder {
            order_id: id.clone(),
            symbol: self.symbol.clone(),
            side,
            price,
            quantity,
            filled_quantity: 0.0,
            status: OrderState::Placed,
            fee: None,
            fee_accounting: FeeAccounting::QuoteDeduction,
            token_id: None,
            raw: None,
        };
        self.state.lock().orders.insert(id.clone(), order);
        id
    }

    fn trigger_market_switch(&self) {
        let listener = self.state.lock().market_switch_listener.clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockAdapter {
    fn exchange_info(&self) -> ExchangeInfo {
        ExchangeInfo {
            id: "mock".into(),
            name: "mock".into(),
            kind: ExchangeKind::Spot,
        }
    }

    async fn trading_rules(&self) -> Result<TradingRules, ExchangeError> {
        Ok(TradingRules {
            tick_size: 0.001,
            price_decimals: 3,
            step_size: 0.00001,
            qty_decimals: 5,
            min_notional: 0.0,
        })
    }

    async fn fee_rate(&self) -> Result<f64, ExchangeError> {
        Ok(0.001)
    }

    async fn ticker_price(&self) -> Result<f64, ExchangeError> {
        Ok(*self.price.lock())
    }

    async fn place_batch_orders(&self, orders: Vec<OrderRequest>) -> Vec<OrderResult> {
        let mut results = Vec::with_capacity(orders.len());
        for request in orders {
            let id = format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let order = ExchangeOrder {
                order_id: id.clone(),
                symbol: self.symbol.clone(),
                side: request.side,
                price: request.price,
                quantity: request.quantity,
                filled_quantity: 0.0,
                status: OrderState::Placed,
                fee: None,
                fee_accounting: FeeAccounting::QuoteDeduction,
                token_id: None,
                raw: None,
            };
            self.state.lock().orders.insert(id.clone(), order);
            results.push(OrderResult::placed(id));
        }
        results
    }

    async fn cancel_batch_orders(&self, order_ids: Vec<String>) -> Vec<OrderResult> {
        let mut results = Vec::with_capacity(order_ids.len());
        let mut state = self.state.lock();
        for id in order_ids {
            match state.orders.get_mut(&id) {
                Some(order) if order.is_active() => {
                    order.status = OrderState::Cancelled;
                    results.push(OrderResult::cancelled(id));
                }
                Some(_) => results.push(OrderResult::failed("order already terminal")),
                None => results.push(OrderResult::failed("unknown order")),
            }
        }
        results
    }

    async fn edit_batch_orders(&self, edits: Vec<EditOrderRequest>) -> Vec<OrderResult> {
        let mut results = Vec::with_capacity(edits.len());
        for edit in edits {
            let cancelled = {
                let mut state = self.state.lock();
                match state.orders.get_mut(&edit.order_id) {
                    Some(order) if order.is_active() => {
                        order.status = OrderState::Cancelled;
                        true
                    }
                    _ => false,
                }
            };
            if !cancelled {
                results.push(OrderResult::failed("edit target not active"));
                continue;
            }
            let placed = self
                .place_batch_orders(vec![OrderRequest::new(edit.side, edit.price, edit.quantity)])
                .await;
            results.push(placed.into_iter().next().unwrap());
        }
        results
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<ExchangeOrder>, ExchangeError> {
        Ok(self.state.lock().orders.get(order_id).cloned())
    }

    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Ok(self.active_orders())
    }

    async fn close(&self) {}

    fn set_market_switch_listener(&self, listener: Arc<dyn Fn() + Send + Sync>) {
        self.state.lock().market_switch_listener = Some(listener);
    }
}

// ==================== harness ====================

struct Harness {
    engine: Arc<TradingEngine>,
    adapter: Arc<MockAdapter>,
    store: Arc<TradeStore>,
    stop: StopSignal,
    _dir: tempfile::TempDir,
}

fn strategy_config() -> StrategyConfig {
    StrategyConfig {
        symbol: "BTCUSDT".into(),
        quantity: 0.01,
        offset_percent: 0.5,
        sell_offset_percent: 1.0,
        grid_levels: 1,
        interval: 0.1,
        reprice_threshold: 0.5,
    }
}

fn harness_with(
    adapter: Arc<MockAdapter>,
    config: StrategyConfig,
    risk: RiskConfig,
    reconcile_interval: Duration,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        TradeStore::open(dir.path().join("trades.db"), 7).expect("trade store"),
    );
    let stop = StopSignal::new();
    let engine = TradingEngine::new(
        EngineConfig {
            strategy_id: 7,
            reconcile_interval,
            ..EngineConfig::default()
        },
        build_strategy(StrategyKind::Grid, config),
        adapter.clone() as Arc<dyn ExchangeAdapter>,
        Arc::new(RiskGovernor::new(risk)),
        Some(store.clone()),
        "[BTC/USDT] [test] [mock]".to_string(),
        stop.clone(),
    );
    Harness {
        engine,
        adapter,
        store,
        stop,
        _dir: dir,
    }
}

fn spawn(engine: &Arc<TradingEngine>) -> tokio::task::JoinHandle<Result<()>> {
    let engine = engine.clone();
    tokio::spawn(async move { engine.run().await })
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

const WAIT: Duration = Duration::from_secs(5);

// ==================== scenarios ====================

/// S1: buy fills, counter-sell goes out, sell fills, pnl is realized.
#[tokio::test]
async fn happy_path_grid_fill() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    // Buy resting at 99.5.
    assert!(
        wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await,
        "initial grid buy never appeared"
    );
    let buy = adapter.active_orders_of_side(Side::Buy).remove(0);
    assert!((buy.price - 99.5).abs() < 1e-9);
    assert!((buy.quantity - 0.01).abs() < 1e-9);

    // Fill it; the engine should record the trade, open the position and
    // place the counter-sell at 100.495, fee-shrunk to 0.00999.
    adapter.fill_order(&buy.order_id, 99.5);
    assert!(
        wait_until(|| adapter.active_orders_of_side(Side::Sell).len() == 1, WAIT).await,
        "counter-sell never appeared"
    );
    let sell = adapter.active_orders_of_side(Side::Sell).remove(0);
    assert!((sell.price - 100.495).abs() < 1e-9, "sell at {}", sell.price);
    assert!((sell.quantity - 0.00999).abs() < 1e-9, "sell qty {}", sell.quantity);
    assert_eq!(h.engine.positions().count(), 1);

    let buy_trade = h.store.get_buy_trade(&buy.order_id).unwrap().unwrap();
    assert!((buy_trade.price - 99.5).abs() < 1e-9);

    // Fill the sell above target; position closes with positive pnl.
    adapter.fill_order(&sell.order_id, 100.6);
    assert!(
        wait_until(|| h.engine.positions().count() == 0, WAIT).await,
        "position never closed"
    );
    let pnl = h.store.recent_pnl("BTCUSDT", 1).unwrap();
    let expected = (100.6 - 99.5) * 0.00999;
    assert!((pnl - expected).abs() < 1e-6, "pnl {pnl} vs {expected}");

    h.stop.trigger();
    let _ = run.await;
}

/// S2: the mark runs away, the resting buy is repriced via one edit.
#[tokio::test]
async fn reprice_beyond_threshold() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    assert!(wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await);
    let old_buy = adapter.active_orders_of_side(Side::Buy).remove(0);

    // 100 -> 101 puts the rung ~1% off target, past the 0.5% threshold.
    adapter.set_price(101.0);
    assert!(
        wait_until(
            || {
                let buys = adapter.active_orders_of_side(Side::Buy);
                buys.len() == 1 && buys[0].order_id != old_buy.order_id
            },
            WAIT
        )
        .await,
        "reprice never replaced the order"
    );
    let new_buy = adapter.active_orders_of_side(Side::Buy).remove(0);
    assert!((new_buy.price - 100.495).abs() < 1e-9, "new price {}", new_buy.price);

    // Engine tracks the replacement, not the old id.
    let (buys, _) = h.engine.pending_orders();
    assert_eq!(buys.len(), 1);
    assert_eq!(buys[0].order_id, new_buy.order_id);

    h.stop.trigger();
    let _ = run.await;
}

/// S3: stop-loss cancels the counter-sell and fires one aggressive limit,
/// exactly once per position.
#[tokio::test]
async fn stop_loss_triggers_once() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig {
            stop_loss_percent: Some(2.0),
            ..RiskConfig::default()
        },
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    assert!(wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await);
    let buy = adapter.active_orders_of_side(Side::Buy).remove(0);
    adapter.fill_order(&buy.order_id, 99.5);
    assert!(wait_until(|| adapter.active_orders_of_side(Side::Sell).len() == 1, WAIT).await);
    let counter = adapter.active_orders_of_side(Side::Sell).remove(0);

    // ~2.01% under entry trips the stop.
    adapter.set_price(97.5);
    assert!(
        wait_until(
            || {
                adapter
                    .venue_orders()
                    .iter()
                    .any(|o| o.order_id == counter.order_id && o.status == OrderState::Cancelled)
            },
            WAIT
        )
        .await,
        "counter-sell was not cancelled"
    );
    assert!(
        wait_until(
            || adapter
                .active_orders_of_side(Side::Sell)
                .iter()
                .any(|o| (o.price - 97.402).abs() < 1e-9),
            WAIT
        )
        .await,
        "liquidation sell missing"
    );

    // A second trigger for the same position must not fire.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let liquidations = adapter
        .venue_orders()
        .iter()
        .filter(|o| o.side == Side::Sell && (o.price - 97.402).abs() < 1e-9)
        .count();
    assert_eq!(liquidations, 1, "stop-loss fired more than once");

    h.stop.trigger();
    let _ = run.await;
}

/// Risk veto: when opens are blocked, no order reaches the venue.
#[tokio::test]
async fn blocked_risk_places_nothing() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig {
            max_position_count: 0,
            ..RiskConfig::default()
        },
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(adapter.venue_orders().is_empty(), "order placed despite risk veto");

    h.stop.trigger();
    let _ = run.await;
}

/// S5 analogue: a market switch clears pending maps and positions before
/// the next tick rebuilds the grid on the new contract.
#[tokio::test]
async fn market_switch_clears_state() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    assert!(wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await);
    let buy = adapter.active_orders_of_side(Side::Buy).remove(0);
    adapter.fill_order(&buy.order_id, 99.5);
    assert!(wait_until(|| h.engine.positions().count() == 1, WAIT).await);

    // Rollover: the venue-side book is gone, the adapter notifies.
    let ids: Vec<String> = adapter.venue_orders().iter().map(|o| o.order_id.clone()).collect();
    for id in ids {
        adapter.vanish_order(&id);
    }
    adapter.trigger_market_switch();

    assert!(
        wait_until(|| h.engine.positions().count() == 0, WAIT).await,
        "positions not cleared after switch"
    );
    // The engine resumes on the fresh market with a new grid buy.
    assert!(
        wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await,
        "grid not rebuilt after switch"
    );

    h.stop.trigger();
    let _ = run.await;
}

/// Partial fills persist one delta row per observation.
#[tokio::test]
async fn partial_fill_writes_delta() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    assert!(wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await);
    let buy = adapter.active_orders_of_side(Side::Buy).remove(0);

    adapter.partial_fill_order(&buy.order_id, 0.004, 99.5);
    assert!(
        wait_until(|| h.store.trade_count().unwrap_or(0) == 1, WAIT).await,
        "partial delta not persisted"
    );
    // The engine still tracks the order as pending.
    let (buys, _) = h.engine.pending_orders();
    assert_eq!(buys.len(), 1);
    assert_eq!(buys[0].state, OrderState::PartiallyFilled);

    h.stop.trigger();
    let _ = run.await;
}

/// An externally-debited fee leaves the counter-order at full size.
#[tokio::test]
async fn external_fee_keeps_counter_size() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    adapter.set_fee_accounting(FeeAccounting::ExternalToken);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    assert!(wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await);
    let buy = adapter.active_orders_of_side(Side::Buy).remove(0);
    adapter.fill_order(&buy.order_id, 99.5);

    assert!(wait_until(|| adapter.active_orders_of_side(Side::Sell).len() == 1, WAIT).await);
    let sell = adapter.active_orders_of_side(Side::Sell).remove(0);
    assert!((sell.quantity - 0.01).abs() < 1e-9, "sell qty shrank: {}", sell.quantity);

    h.stop.trigger();
    let _ = run.await;
}

/// Crash recovery: orders already resting on the venue are adopted, not
/// re-created.
#[tokio::test]
async fn recovers_existing_orders_on_start() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    adapter.inject_order(Side::Buy, 99.5, 0.01);
    adapter.inject_order(Side::Sell, 100.5, 0.01);

    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    assert!(
        wait_until(
            || {
                let (buys, sells) = h.engine.pending_counts();
                buys == 1 && sells == 1
            },
            WAIT
        )
        .await,
        "orders not recovered"
    );
    // No duplicate grid buy: the recovered one already occupies the rung.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(adapter.active_orders_of_side(Side::Buy).len(), 1);

    h.stop.trigger();
    let _ = run.await;
}

/// Missing-from-exchange debounce: one reconcile tolerates, two evict.
#[tokio::test]
async fn missing_order_evicted_after_two_reconciles() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_millis(300),
    );
    let run = spawn(&h.engine);

    assert!(wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await);
    let buy = adapter.active_orders_of_side(Side::Buy).remove(0);

    // A far-away bystander keeps the venue book non-empty so the reconcile
    // safety guard does not kick in.
    adapter.inject_order(Side::Sell, 150.0, 0.01);

    // Vanish without a terminal status; get_order returns None.
    adapter.vanish_order(&buy.order_id);

    assert!(
        wait_until(
            || {
                let (buys, _) = h.engine.pending_orders();
                !buys.iter().any(|o| o.order_id == buy.order_id)
            },
            Duration::from_secs(10)
        )
        .await,
        "vanished order never evicted"
    );

    h.stop.trigger();
    let _ = run.await;
}

/// Invariant 6: after stop() both maps are empty and the venue holds no
/// active orders. Concurrent stops produce one clean stop.
#[tokio::test]
async fn stop_cancels_everything() {
    let adapter = MockAdapter::new("BTCUSDT", 100.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    assert!(wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await);

    let (first, second) = tokio::join!(h.engine.stop(), h.engine.stop());
    let _ = (first, second);
    let _ = run.await;

    let (buys, sells) = h.engine.pending_counts();
    assert_eq!(buys + sells, 0);
    assert!(adapter.active_orders().is_empty(), "venue still has active orders");
}

/// Boundary: a non-positive ticker skips the tick without touching state.
#[tokio::test]
async fn zero_price_skips_tick() {
    let adapter = MockAdapter::new("BTCUSDT", 0.0);
    let h = harness_with(
        adapter.clone(),
        strategy_config(),
        RiskConfig::default(),
        Duration::from_secs(60),
    );
    let run = spawn(&h.engine);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(adapter.venue_orders().is_empty(), "orders placed with no valid price");
    assert!(h.engine.last_error().is_some());

    // Price arrives; the engine recovers on its own.
    adapter.set_price(100.0);
    assert!(wait_until(|| adapter.active_orders_of_side(Side::Buy).len() == 1, WAIT).await);

    h.stop.trigger();
    let _ = run.await;
}

// ==================== coordinator double (S6) ====================

#[derive(Default)]
struct MemoryCoordinatorState {
    locks: HashMap<i64, String>,
    running: HashMap<i64, HashMap<String, String>>,
    workers: Vec<String>,
    queues: HashMap<String, Vec<String>>,
    dedup: BTreeMap<String, String>,
}

#[derive(Default)]
struct MemoryCoordinator {
    state: Mutex<MemoryCoordinatorState>,
}

#[async_trait]
impl CoordinatorStore for MemoryCoordinator {
    async fn acquire_lock(&self, strategy_id: i64, task_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.locks.get(&strategy_id) {
            Some(holder) => Ok(holder == task_id),
            None => {
                state.locks.insert(strategy_id, task_id.to_string());
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, strategy_id: i64) -> Result<()> {
        self.state.lock().locks.remove(&strategy_id);
        Ok(())
    }

    async fn lock_holder(&self, strategy_id: i64) -> Result<Option<String>> {
        Ok(self.state.lock().locks.get(&strategy_id).cloned())
    }

    async fn set_running_info(&self, strategy_id: i64, info: &RunningInfo) -> Result<()> {
        let fields = info.to_fields().into_iter().collect();
        self.state.lock().running.insert(strategy_id, fields);
        Ok(())
    }

    async fn update_running_fields(
        &self,
        strategy_id: i64,
        fields: Vec<(String, String)>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.running.entry(strategy_id).or_default();
        for (key, value) in fields {
            entry.insert(key, value);
        }
        Ok(())
    }

    async fn running_info(&self, strategy_id: i64) -> Result<Option<HashMap<String, String>>> {
        Ok(self.state.lock().running.get(&strategy_id).cloned())
    }

    async fn clear_running_info(&self, strategy_id: i64) -> Result<()> {
        self.state.lock().running.remove(&strategy_id);
        Ok(())
    }

    async fn register_worker(&self, worker: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.workers.iter().any(|w| w == worker) {
            state.workers.push(worker.to_string());
        }
        Ok(())
    }

    async fn unregister_worker(&self, worker: &str) -> Result<()> {
        self.state.lock().workers.retain(|w| w != worker);
        Ok(())
    }

    async fn active_workers(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().workers.clone())
    }

    async fn push_task(&self, queue: &str, payload: &str) -> Result<()> {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push(payload.to_string());
        Ok(())
    }

    async fn pop_task(&self, queues: &[String], _timeout_secs: f64) -> Result<Option<String>> {
        let mut state = self.state.lock();
        for queue in queues {
            if let Some(items) = state.queues.get_mut(queue) {
                if !items.is_empty() {
                    return Ok(Some(items.remove(0)));
                }
            }
        }
        Ok(None)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, _ttl_secs: u64) -> Result<bool> {
        let mut state = self.state.lock();
        if state.dedup.contains_key(key) {
            return Ok(false);
        }
        state.dedup.insert(key.to_string(), value.to_string());
        Ok(true)
    }
}

/// S6: two tasks race for the same strategy; exactly one wins, the loser is
/// rejected with the holder's id, and both workers stay registered.
#[tokio::test]
async fn lock_contention_admits_one_task() {
    let store = MemoryCoordinator::default();

    store.register_worker("worker-a").await.unwrap();
    store.register_worker("worker-b").await.unwrap();

    let first = store.acquire_lock(7, "task-a").await.unwrap();
    let second = store.acquire_lock(7, "task-b").await.unwrap();
    assert!(first);
    assert!(!second);
    assert_eq!(store.lock_holder(7).await.unwrap().as_deref(), Some("task-a"));

    // Re-acquisition by the holder is a no-op success.
    assert!(store.acquire_lock(7, "task-a").await.unwrap());

    let workers = store.active_workers().await.unwrap();
    assert!(workers.contains(&"worker-a".to_string()));
    assert!(workers.contains(&"worker-b".to_string()));

    store.release_lock(7).await.unwrap();
    assert!(store.acquire_lock(7, "task-b").await.unwrap());
}

/// Notification dedup through the store: first send wins the window.
#[tokio::test]
async fn notify_dedup_through_store() {
    let store = MemoryCoordinator::default();
    assert!(store.set_nx_ex("notify:rl:u:order_failed:7", "1", 60).await.unwrap());
    assert!(!store.set_nx_ex("notify:rl:u:order_failed:7", "1", 60).await.unwrap());
    assert!(store.set_nx_ex("notify:rl:u:order_failed:8", "1", 60).await.unwrap());
}
