//! Prediction-market grid: additive cent offsets on a [0.01, 0.99] price
//! band instead of percentage offsets on an unbounded one.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde_json::{json, Value};

use crate::domain::{Order, PositionEntry, Side};

use super::{used_grid_indices, Strategy, StrategyConfig, TradeDecision};

const MIN_PRICE: f64 = 0.01;
const MAX_PRICE: f64 = 0.99;

pub struct PredictionGridStrategy {
    config: StrategyConfig,
}

impl PredictionGridStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    fn buy_price(&self, current_price: f64, grid_index: i32) -> f64 {
        let offset = grid_index as f64 * self.config.offset_percent / 100.0;
        clamp_price(current_price - offset)
    }

    fn sell_price(&self, buy_price: f64) -> f64 {
        clamp_price(buy_price + self.config.sell_offset_percent / 100.0)
    }
}

fn clamp_price(price: f64) -> f64 {
    (price.clamp(MIN_PRICE, MAX_PRICE) * 100.0).round() / 100.0
}

impl Strategy for PredictionGridStrategy {
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
            let price = self.buy_price(current_price, i);
            decisions.push(TradeDecision {
                side: Side::Buy,
                price,
                quantity: self.config.quantity,
                grid_index: i,
                reason: format!("contract grid {i} open"),
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
            reason: "contract buy filled, placing counter-sell".to_string(),
        })
    }

    fn reprice(
        &self,
        order_price: f64,
        current_price: f64,
        is_buy: bool,
        grid_index: i32,
    ) -> Option<f64> {
        if !is_buy {
            return None;
        }
        let target = self.buy_price(current_price, grid_index.max(1));
        // Cent prices compare in cents, not percent: one tick of drift
        // against the reprice threshold expressed in cents.
        let diff_cents = (order_price - target).abs() * 100.0;
        if diff_cents > self.config.reprice_threshold {
            Some(target)
        } else {
            None
        }
    }

    fn status_extra(&self, current_price: f64) -> BTreeMap<String, Value> {
        let mut extra = BTreeMap::new();
        extra.insert("implied_probability".to_string(), json!(current_price));
        extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StrategyConfig {
        StrategyConfig {
            symbol: "btc-Up".into(),
            quantity: 10.0,
            offset_percent: 2.0,
            sell_offset_percent: 3.0,
            grid_levels: 2,
            interval: 1.0,
            reprice_threshold: 1.0,
        }
    }

    #[test]
    fn offsets_are_additive_cents() {
        let strategy = PredictionGridStrategy::new(config());
        let decisions = strategy.buy_batch(0.50, &HashMap::new(), &HashMap::new(), &[]);
        assert_eq!(decisions.len(), 2);
        assert!((decisions[0].price - 0.48).abs() < 1e-9);
        assert!((decisions[1].price - 0.46).abs() < 1e-9);
    }

    #[test]
    fn prices_clamp_to_the_band() {
        let strategy = PredictionGridStrategy::new(config());
        let decisions = strategy.buy_batch(0.02, &HashMap::new(), &HashMap::new(), &[]);
        assert!(decisions.iter().all(|d| d.price >= 0.01));

        let sell = strategy.sell_for(0.98, 10.0, 0.98).unwrap();
        assert!((sell.price - 0.99).abs() < 1e-9);
    }

    #[test]
    fn sell_adds_the_close_offset() {
        let strategy = PredictionGridStrategy::new(config());
        let sell = strategy.sell_for(0.48, 10.0, 0.50).unwrap();
        assert!((sell.price - 0.51).abs() < 1e-9);
    }

    #[test]
    fn reprice_compares_in_cents() {
        let strategy = PredictionGridStrategy::new(config());
        // Resting buy at 0.48; mark moved to 0.55, target 0.53 — 5 cents off.
        let target = strategy.reprice(0.48, 0.55, true, 1).unwrap();
        assert!((target - 0.53).abs() < 1e-9);
        // One cent of drift stays within the threshold.
        assert!(strategy.reprice(0.48, 0.51, true, 1).is_none());
    }
}
