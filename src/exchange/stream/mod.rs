//! Per-credential venue stream managers.
//!
//! One manager multiplexes the market and user sockets for every engine
//! bound to the same credentials; acquire/release reference counting tears
//! the sockets down when the last holder leaves.

pub mod prediction_stream;
pub mod spot_stream;

use std::time::Duration;

pub const PRICE_MAX_AGE: Duration = Duration::from_secs(5);
pub const MAX_ORDER_CACHE_SIZE: usize = 1000;
pub const RECONCILE_INTERVAL_CALLS: u64 = 3;
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

use std::collections::HashMap;

use crate::domain::OrderState;
use crate::exchange::ExchangeOrder;

/// Drop half of the terminal entries (oldest ids first) once the cache
/// exceeds its cap. Active orders are never evicted.
pub(crate) fn evict_terminal_orders(orders: &mut HashMap<String, ExchangeOrder>) {
    if orders.len() <= MAX_ORDER_CACHE_SIZE {
        return;
    }
    let mut terminal: Vec<String> = orders
        .iter()
        .filter(|(_, o)| matches!(o.status, OrderState::Filled | OrderState::Cancelled | OrderState::Failed))
        .map(|(id, _)| id.clone())
        .collect();
    if terminal.len() <= MAX_ORDER_CACHE_SIZE / 2 {
        return;
    }
    terminal.sort();
    let drop_count = terminal.len() / 2;
    for id in terminal.into_iter().take(drop_count) {
        orders.remove(&id);
    }
}
