//! Strategy family: a closed set of grid variants behind one capability
//! interface.
//!
//! Strategies are pure decision makers. They never execute orders, never
//! persist state and never consult risk limits; the engine owns all of
//! that. The short-side methods default to "no decision" so long-only
//! variants stay oblivious to the short path.

mod bilateral;
mod grid;
mod prediction;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Order, PositionEntry, Side};

pub use bilateral::{BilateralGridStrategy, ShortGridStrategy};
pub use grid::GridStrategy;
pub use prediction::PredictionGridStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub symbol: String,
    /// Base order size per grid rung.
    pub quantity: f64,
    /// Opening offset below (long) / above (short) the mark, percent per rung.
    pub offset_percent: f64,
    /// Closing offset relative to the entry price, percent.
    pub sell_offset_percent: f64,
    pub grid_levels: u32,
    /// Engine poll interval, seconds.
    pub interval: f64,
    /// Reprice when a resting order drifts this many percent off target.
    pub reprice_threshold: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            quantity: 0.0,
            offset_percent: 0.5,
            sell_offset_percent: 1.0,
            grid_levels: 1,
            interval: 1.0,
            reprice_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeDecision {
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub grid_index: i32,
    pub reason: String,
}

/// The capability interface the engine drives each tick.
pub trait Strategy: Send + Sync {
    fn config(&self) -> &StrategyConfig;

    /// Opening decisions for the long side; one entry per free grid rung.
    fn buy_batch(
        &self,
        current_price: f64,
        pending_buys: &HashMap<String, Order>,
        pending_sells: &HashMap<String, Order>,
        positions: &[PositionEntry],
    ) -> Vec<TradeDecision>;

    /// Counter-order for a filled opening buy.
    fn sell_for(
        &self,
        buy_price: f64,
        buy_quantity: f64,
        current_price: f64,
    ) -> Option<TradeDecision>;

    /// New price for a drifted resting order, or None to leave it.
    fn reprice(
        &self,
        order_price: f64,
        current_price: f64,
        is_buy: bool,
        grid_index: i32,
    ) -> Option<f64>;

    /// Opening decisions for the short side (negative grid indices).
    fn short_batch(
        &self,
        _current_price: f64,
        _pending_short_opens: &HashMap<String, Order>,
        _pending_short_closes: &HashMap<String, Order>,
        _short_positions: &[PositionEntry],
    ) -> Vec<TradeDecision> {
        Vec::new()
    }

    /// Counter-order for a filled short open.
    fn close_short_for(
        &self,
        _open_price: f64,
        _open_quantity: f64,
        _current_price: f64,
    ) -> Option<TradeDecision> {
        None
    }

    fn reprice_short(
        &self,
        _order_price: f64,
        _current_price: f64,
        _grid_index: i32,
    ) -> Option<f64> {
        None
    }

    /// Strategy-specific fields merged into the status snapshot.
    fn status_extra(&self, _current_price: f64) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Grid,
    BilateralGrid,
    ShortGrid,
    PredictionGrid,
}

/// The closed set of strategy variants; no open-ended subclassing.
pub fn build_strategy(kind: StrategyKind, config: StrategyConfig) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::Grid => Arc::new(GridStrategy::new(config)),
        StrategyKind::BilateralGrid => Arc::new(BilateralGridStrategy::new(config)),
        StrategyKind::ShortGrid => Arc::new(ShortGridStrategy::new(config)),
        StrategyKind::PredictionGrid => Arc::new(PredictionGridStrategy::new(config)),
    }
}

/// Grid rungs already occupied on one side, derived from resting orders and
/// open positions. `want_long` selects the sign of the indices considered.
pub(crate) fn used_grid_indices(
    opens: &HashMap<String, Order>,
    closes: &HashMap<String, Order>,
    positions: &[PositionEntry],
    want_long: bool,
) -> std::collections::HashSet<i32> {
    let keep = |idx: i32| if want_long { idx > 0 } else { idx < 0 };
    opens
        .values()
        .chain(closes.values())
        .map(|o| o.grid_index)
        .chain(positions.iter().map(|p| p.grid_index))
        .filter(|&idx| keep(idx))
        .collect()
}
