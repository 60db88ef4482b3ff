//! Bilateral grid: the long side of [`GridStrategy`] plus a mirrored short
//! side above the mark, and a short-only variant that mutes the long side.

use std::collections::HashMap;

use crate::domain::{Order, PositionEntry, Side};

use super::{used_grid_indices, GridStrategy, Strategy, StrategyConfig, TradeDecision};

pub struct BilateralGridStrategy {
    long: GridStrategy,
}

impl BilateralGridStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            long: GridStrategy::new(config),
        }
    }

    fn short_price(&self, current_price: f64, grid_index: i32) -> f64 {
        let offset = grid_index.unsigned_abs() as f64 * self.config().offset_percent / 100.0;
        current_price * (1.0 + offset)
    }
}

impl Strategy for BilateralGridStrategy {
    fn config(&self) -> &StrategyConfig {
        self.long.config()
    }

    fn buy_batch(
        &self,
        current_price: f64,
        pending_buys: &HashMap<String, Order>,
        pending_sells: &HashMap<String, Order>,
        positions: &[PositionEntry],
    ) -> Vec<TradeDecision> {
        self.long
            .buy_batch(current_price, pending_buys, pending_sells, positions)
    }

    fn sell_for(
        &self,
        buy_price: f64,
        buy_quantity: f64,
        current_price: f64,
    ) -> Option<TradeDecision> {
        self.long.sell_for(buy_price, buy_quantity, current_price)
    }

    fn reprice(
        &self,
        order_price: f64,
        current_price: f64,
        is_buy: bool,
        grid_index: i32,
    ) -> Option<f64> {
        self.long
            .reprice(order_price, current_price, is_buy, grid_index)
    }

    fn short_batch(
        &self,
        current_price: f64,
        pending_short_opens: &HashMap<String, Order>,
        pending_short_closes: &HashMap<String, Order>,
        short_positions: &[PositionEntry],
    ) -> Vec<TradeDecision> {
        let config = self.config();
        let committed = pending_short_opens.len()
            + short_positions.iter().filter(|p| p.grid_index < 0).count();
        if committed >= config.grid_levels as usize {
            return Vec::new();
        }

        let used = used_grid_indices(
            pending_short_opens,
            pending_short_closes,
            short_positions,
            false,
        );
        let mut decisions = Vec::new();

        for i in 1..=config.grid_levels as i32 {
            let grid_index = -i;
            if used.contains(&grid_index) {
                continue;
            }
            if committed + decisions.len() >= config.grid_levels as usize {
                break;
            }
            decisions.push(TradeDecision {
                side: Side::Sell,
                price: self.short_price(current_price, grid_index),
                quantity: config.quantity,
                grid_index,
                reason: format!("short grid {i} open"),
            });
        }

        decisions
    }

    fn close_short_for(
        &self,
        open_price: f64,
        open_quantity: f64,
        _current_price: f64,
    ) -> Option<TradeDecision> {
        let close_price = open_price * (1.0 - self.config().sell_offset_percent / 100.0);
        Some(TradeDecision {
            side: Side::Buy,
            price: close_price,
            quantity: open_quantity,
            grid_index: 0,
            reason: "short filled, placing counter-buy".to_string(),
        })
    }

    fn reprice_short(
        &self,
        order_price: f64,
        current_price: f64,
        grid_index: i32,
    ) -> Option<f64> {
        let target = self.short_price(current_price, grid_index);
        if target <= 0.0 {
            return None;
        }
        let diff_pct = (order_price - target).abs() / target * 100.0;
        if diff_pct > self.config().reprice_threshold {
            Some(target)
        } else {
            None
        }
    }
}

/// Pure short mode: the long-side methods produce nothing, so the engine
/// naturally runs only the short path.
pub struct ShortGridStrategy {
    inner: BilateralGridStrategy,
}

impl ShortGridStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            inner: BilateralGridStrategy::new(config),
        }
    }
}

impl Strategy for ShortGridStrategy {
    fn config(&self) -> &StrategyConfig {
        self.inner.config()
    }

    fn buy_batch(
        &self,
        _current_price: f64,
        _pending_buys: &HashMap<String, Order>,
        _pending_sells: &HashMap<String, Order>,
        _positions: &[PositionEntry],
    ) -> Vec<TradeDecision> {
        Vec::new()
    }

    fn sell_for(&self, _: f64, _: f64, _: f64) -> Option<TradeDecision> {
        None
    }

    fn reprice(&self, _: f64, _: f64, _: bool, _: i32) -> Option<f64> {
        None
    }

    fn short_batch(
        &self,
        current_price: f64,
        pending_short_opens: &HashMap<String, Order>,
        pending_short_closes: &HashMap<String, Order>,
        short_positions: &[PositionEntry],
    ) -> Vec<TradeDecision> {
        self.inner.short_batch(
            current_price,
            pending_short_opens,
            pending_short_closes,
            short_positions,
        )
    }

    fn close_short_for(
        &self,
        open_price: f64,
        open_quantity: f64,
        current_price: f64,
    ) -> Option<TradeDecision> {
        self.inner
            .close_short_for(open_price, open_quantity, current_price)
    }

    fn reprice_short(
        &self,
        order_price: f64,
        current_price: f64,
        grid_index: i32,
    ) -> Option<f64> {
        self.inner
            .reprice_short(order_price, current_price, grid_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StrategyConfig {
        StrategyConfig {
            symbol: "ETH/USDT".into(),
            quantity: 0.1,
            offset_percent: 1.0,
            sell_offset_percent: 2.0,
            grid_levels: 2,
            interval: 1.0,
            reprice_threshold: 0.5,
        }
    }

    #[test]
    fn shorts_open_above_the_mark() {
        let strategy = BilateralGridStrategy::new(config());
        let decisions =
            strategy.short_batch(100.0, &HashMap::new(), &HashMap::new(), &[]);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].grid_index, -1);
        assert_eq!(decisions[0].side, Side::Sell);
        assert!((decisions[0].price - 101.0).abs() < 1e-9);
        assert!((decisions[1].price - 102.0).abs() < 1e-9);
    }

    #[test]
    fn short_close_is_below_entry() {
        let strategy = BilateralGridStrategy::new(config());
        let decision = strategy.close_short_for(101.0, 0.1, 100.0).unwrap();
        assert_eq!(decision.side, Side::Buy);
        assert!((decision.price - 98.98).abs() < 1e-9);
    }

    #[test]
    fn short_positions_occupy_their_rung() {
        let strategy = BilateralGridStrategy::new(config());
        let positions = vec![PositionEntry {
            order_id: "s".into(),
            symbol: "ETH/USDT".into(),
            quantity: 0.1,
            entry_price: 101.0,
            grid_index: -1,
            created_at: chrono::Utc::now(),
        }];
        let decisions =
            strategy.short_batch(100.0, &HashMap::new(), &HashMap::new(), &positions);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].grid_index, -2);
    }

    #[test]
    fn short_only_mutes_the_long_side() {
        let strategy = ShortGridStrategy::new(config());
        assert!(strategy
            .buy_batch(100.0, &HashMap::new(), &HashMap::new(), &[])
            .is_empty());
        assert!(strategy.sell_for(99.0, 0.1, 100.0).is_none());
        assert!(!strategy
            .short_batch(100.0, &HashMap::new(), &HashMap::new(), &[])
            .is_empty());
    }

    #[test]
    fn short_reprice_tracks_the_mark() {
        let strategy = BilateralGridStrategy::new(config());
        // Resting short open at 101 with the mark now at 99: target 99.99.
        let target = strategy.reprice_short(101.0, 99.0, -1).unwrap();
        assert!((target - 99.99).abs() < 1e-9);
        assert!(strategy.reprice_short(101.0, 100.2, -1).is_none());
    }
}
