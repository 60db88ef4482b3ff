//! Reconciliation math for the periodic repair pass.
//!
//! Computes which positions lack a counter-order and which counter-orders
//! lost their opener, and debounces "missing from exchange" observations so
//! one flaky reconcile never evicts a live order.

use std::collections::{HashMap, HashSet};

use crate::domain::{Order, PositionEntry};

pub const DEFAULT_MISSING_THRESHOLD: u32 = 2;

#[derive(Debug)]
pub struct PositionSyncer {
    missing_threshold: u32,
    missing_counts: HashMap<String, u32>,
}

impl Default for PositionSyncer {
    fn default() -> Self {
        Self::new(DEFAULT_MISSING_THRESHOLD)
    }
}

impl PositionSyncer {
    pub fn new(missing_threshold: u32) -> Self {
        Self {
            missing_threshold: missing_threshold.max(1),
            missing_counts: HashMap::new(),
        }
    }

    /// Positions with no pending counter-order pointing back at them.
    pub fn positions_without_closes(
        positions: &[PositionEntry],
        pending_closes: &HashMap<String, Order>,
    ) -> Vec<PositionEntry> {
        let related: HashSet<&str> = pending_closes
            .values()
            .filter_map(|o| o.related_order_id.as_deref())
            .collect();

        positions
            .iter()
            .filter(|p| !related.contains(p.order_id.as_str()))
            .cloned()
            .collect()
    }

    /// Counter-orders whose opening position no longer exists.
    pub fn orphan_counter_orders(
        positions: &[PositionEntry],
        pending_closes: &HashMap<String, Order>,
    ) -> Vec<Order> {
        let open_ids: HashSet<&str> = positions.iter().map(|p| p.order_id.as_str()).collect();

        pending_closes
            .values()
            .filter(|o| {
                o.related_order_id
                    .as_deref()
                    .is_some_and(|related| !open_ids.contains(related))
            })
            .cloned()
            .collect()
    }

    /// Record one reconcile's view of which tracked ids the exchange did not
    /// report. Returns the ids whose consecutive-missing count reached the
    /// threshold; those are purged from the debounce map and should be
    /// evicted by the caller. Ids seen again reset their count.
    pub fn observe_missing(
        &mut self,
        tracked_ids: &[String],
        exchange_ids: &HashSet<String>,
    ) -> Vec<String> {
        let mut evict = Vec::new();

        for id in tracked_ids {
            if exchange_ids.contains(id) {
                self.missing_counts.remove(id);
                continue;
            }

            let count = self.missing_counts.entry(id.clone()).or_insert(0);
            *count += 1;
            if *count >= self.missing_threshold {
                self.missing_counts.remove(id);
                evict.push(id.clone());
            }
        }

        // Ids no longer tracked keep no stale counts.
        self.missing_counts
            .retain(|id, _| tracked_ids.iter().any(|t| t == id));

        evict
    }

    pub fn clear(&mut self) {
        self.missing_counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderState, Side};
    use chrono::Utc;

    fn position(order_id: &str, grid_index: i32) -> PositionEntry {
        PositionEntry {
            order_id: order_id.to_string(),
            symbol: "BTC/USDT".to_string(),
            quantity: 0.01,
            entry_price: 99.5,
            grid_index,
            created_at: Utc::now(),
        }
    }

    fn close_order(id: &str, related: &str) -> (String, Order) {
        let order = Order::new(id, "BTC/USDT", Side::Sell, 100.5, 0.01, 1)
            .with_state(OrderState::Placed)
            .with_related(related);
        (id.to_string(), order)
    }

    #[test]
    fn finds_unpaired_positions() {
        let positions = vec![position("open1", 1), position("open2", 2)];
        let closes: HashMap<_, _> = [close_order("sell1", "open1")].into_iter().collect();

        let unpaired = PositionSyncer::positions_without_closes(&positions, &closes);
        assert_eq!(unpaired.len(), 1);
        assert_eq!(unpaired[0].order_id, "open2");
    }

    #[test]
    fn finds_orphan_counter_orders() {
        let positions = vec![position("open1", 1)];
        let closes: HashMap<_, _> = [
            close_order("sell1", "open1"),
            close_order("sell2", "gone"),
        ]
        .into_iter()
        .collect();

        let orphans = PositionSyncer::orphan_counter_orders(&positions, &closes);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].order_id, "sell2");
    }

    #[test]
    fn missing_once_is_tolerated_twice_evicts() {
        let mut syncer = PositionSyncer::new(2);
        let tracked = vec!["a".to_string()];
        let empty = HashSet::new();

        assert!(syncer.observe_missing(&tracked, &empty).is_empty());
        let evicted = syncer.observe_missing(&tracked, &empty);
        assert_eq!(evicted, vec!["a".to_string()]);

        // After eviction the slate is clean.
        assert!(syncer.observe_missing(&tracked, &empty).is_empty());
    }

    #[test]
    fn reappearing_order_resets_its_count() {
        let mut syncer = PositionSyncer::new(2);
        let tracked = vec!["a".to_string()];
        let empty = HashSet::new();
        let present: HashSet<String> = ["a".to_string()].into_iter().collect();

        assert!(syncer.observe_missing(&tracked, &empty).is_empty());
        assert!(syncer.observe_missing(&tracked, &present).is_empty());
        // Count restarted: one more miss is still below the threshold.
        assert!(syncer.observe_missing(&tracked, &empty).is_empty());
    }
}
