//! In-memory position tracking, keyed by the opening order id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// One open position. Created when an opening order fills, removed when the
/// paired closing order fills; never repriced in place.
#[derive(Debug, Clone)]
pub struct PositionEntry {
    pub order_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub grid_index: i32,
    pub created_at: DateTime<Utc>,
}

impl PositionEntry {
    pub fn cost(&self) -> f64 {
        self.quantity * self.entry_price
    }

    /// Mark-to-market pnl; the sign inverts for short-side entries
    /// (negative grid index).
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        let raw = (mark - self.entry_price) * self.quantity;
        if self.grid_index < 0 {
            -raw
        } else {
            raw
        }
    }

    pub fn is_short(&self) -> bool {
        self.grid_index < 0
    }
}

#[derive(Default)]
pub struct PositionTracker {
    positions: Mutex<HashMap<String, PositionEntry>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        order_id: impl Into<String>,
        symbol: impl Into<String>,
        quantity: f64,
        entry_price: f64,
        grid_index: i32,
    ) {
        let order_id = order_id.into();
        let entry = PositionEntry {
            order_id: order_id.clone(),
            symbol: symbol.into(),
            quantity,
            entry_price,
            grid_index,
            created_at: Utc::now(),
        };
        self.positions.lock().insert(order_id, entry);
    }

    pub fn remove(&self, order_id: &str) -> Option<PositionEntry> {
        self.positions.lock().remove(order_id)
    }

    pub fn get(&self, order_id: &str) -> Option<PositionEntry> {
        self.positions.lock().get(order_id).cloned()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.positions.lock().contains_key(order_id)
    }

    pub fn all(&self) -> Vec<PositionEntry> {
        self.positions.lock().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.positions.lock().len()
    }

    pub fn total_quantity(&self) -> f64 {
        self.positions.lock().values().map(|p| p.quantity).sum()
    }

    pub fn total_cost(&self) -> f64 {
        self.positions.lock().values().map(|p| p.cost()).sum()
    }

    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        self.positions
            .lock()
            .values()
            .map(|p| p.unrealized_pnl(mark))
            .sum()
    }

    pub fn clear(&self) {
        self.positions.lock().clear();
    }
}
