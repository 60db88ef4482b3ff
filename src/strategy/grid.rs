//! Long-side grid: buy rungs below the mark, mirrored sell per fill.

use std::collections::HashMap;

use tracing::debug;

use crate::domain::{Order, PositionEntry, Side};

use super::{used_grid_indices, Strategy, StrategyConfig, TradeDecision};

pub struct GridStrategy {
    config: StrategyConfig,
}

impl GridStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub(crate) fn buy_price(&self, current_price: f64, grid_index: i32) -> f64 {
        let offset = grid_index as f64 * self.config.offset_percent / 100.0;
        current_price * (1.0 - offset)
    }

    pub(crate) fn sell_price(&self, buy_price: f64) -> f64 {
        buy_price * (1.0 + self.config.sell_offset_percent / 100.0)
    }
}

impl Strategy for GridStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    fn buy_batch(
        &self,
        current_price: f64,
        pending_buys: &HashMap<String, Order>,
        pending_sells: &HashMap<String, Order>,
        positions: &[PositionEntry],
    ) -> Vec<TradeDecision> {
        let long_positions = positions.iter().filter(|p| p.grid_index > 0).count();
        let committed = pending_buys.len() + long_positions;
        if committed >= self.config.grid_levels as usize {
            debug!(
                committed,
                grid = self.config.grid_levels,
                price = current_price,
                "grid full, no new buys"
            );
            return Vec::new();
        }

        let used = used_grid_indices(pending_buys, pending_sells, positions, true);
        let mut decisions = Vec::new();

        for i in 1..=self.config.grid_levels as i32 {
            if used.contains(&i) {
                continue;
            }
            if committed + decisions.len() >= self.config.grid_levels as usize {
                break;
            }
            decisions.push(TradeDecision {
                side: Side::Buy,
                price: self.buy_price(current_price, i),
                quantity: self.config.quantity,
                grid_index: i,
                reason: format!("grid {i} open"),
            });
        }

        decisions
    }

    fn sell_for(
        &self,
        buy_price: f64,
        buy_quantity: f64,
        _current_price: f64,
    ) -> Option<TradeDecision> {
        Some(TradeDecision {
            side: Side::Sell,
            price: self.sell_price(buy_price),
            quantity: buy_quantity,
            grid_index: 0,
            reason: "buy filled, placing counter-sell".to_string(),
        })
    }

    fn reprice(
        &self,
        order_price: f64,
        current_price: f64,
        is_buy: bool,
        grid_index: i32,
    ) -> Option<f64> {
        // Counter-sells stay anchored to their entry; only opens chase the mark.
        if !is_buy {
            return None;
        }

        let target = self.buy_price(current_price, grid_index.max(1));
        if target <= 0.0 {
            return None;
        }
        let diff_pct = (order_price - target).abs() / target * 100.0;
        if diff_pct > self.config.reprice_threshold {
            debug!(
                old = order_price,
                target,
                diff_pct,
                threshold = self.config.reprice_threshold,
                "buy drifted past threshold"
            );
            Some(target)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderState;

    fn config() -> StrategyConfig {
        StrategyConfig {
            symbol: "BTC/USDT".into(),
            quantity: 0.01,
            offset_percent: 0.5,
            sell_offset_percent: 1.0,
            grid_levels: 2,
            interval: 1.0,
            reprice_threshold: 0.5,
        }
    }

    fn pending(side: Side, grid_index: i32) -> (String, Order) {
        let id = format!("{side}-{grid_index}");
        let mut order = Order::new(id.clone(), "BTC/USDT", side, 99.0, 0.01, grid_index);
        order.state = OrderState::Placed;
        (id, order)
    }

    #[test]
    fn fills_free_rungs_below_mark() {
        let strategy = GridStrategy::new(config());
        let decisions = strategy.buy_batch(100.0, &HashMap::new(), &HashMap::new(), &[]);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].grid_index, 1);
        assert!((decisions[0].price - 99.5).abs() < 1e-9);
        assert_eq!(decisions[1].grid_index, 2);
        assert!((decisions[1].price - 99.0).abs() < 1e-9);
    }

    #[test]
    fn occupied_rungs_are_skipped() {
        let strategy = GridStrategy::new(config());
        let buys: HashMap<_, _> = [pending(Side::Buy, 1)].into_iter().collect();
        let decisions = strategy.buy_batch(100.0, &buys, &HashMap::new(), &[]);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].grid_index, 2);
    }

    #[test]
    fn positions_count_toward_grid_capacity() {
        let strategy = GridStrategy::new(config());
        let positions = vec![
            PositionEntry {
                order_id: "a".into(),
                symbol: "BTC/USDT".into(),
                quantity: 0.01,
                entry_price: 99.5,
                grid_index: 1,
                created_at: chrono::Utc::now(),
            },
            PositionEntry {
                order_id: "b".into(),
                symbol: "BTC/USDT".into(),
                quantity: 0.01,
                entry_price: 99.0,
                grid_index: 2,
                created_at: chrono::Utc::now(),
            },
        ];
        let decisions = strategy.buy_batch(100.0, &HashMap::new(), &HashMap::new(), &positions);
        assert!(decisions.is_empty());
    }

    #[test]
    fn sell_is_offset_from_buy_price() {
        let strategy = GridStrategy::new(config());
        let decision = strategy.sell_for(99.5, 0.01, 100.0).unwrap();
        assert_eq!(decision.side, Side::Sell);
        assert!((decision.price - 100.495).abs() < 1e-9);
        assert_eq!(decision.quantity, 0.01);
    }

    #[test]
    fn reprice_only_past_threshold() {
        let strategy = GridStrategy::new(config());
        // Mark moved 100 -> 101; resting buy at 99.5 vs target 100.495
        // drifts ~0.99%, past the 0.5% threshold.
        let target = strategy.reprice(99.5, 101.0, true, 1).unwrap();
        assert!((target - 100.495).abs() < 1e-9);

        // Small drift stays put.
        assert!(strategy.reprice(99.5, 100.1, true, 1).is_none());

        // Sells never reprice.
        assert!(strategy.reprice(100.5, 120.0, false, 1).is_none());
    }
}
