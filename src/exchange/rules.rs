//! Per-symbol trading rules and floor-to-grid alignment.
//!
//! Engines never submit raw floats: every candidate price and quantity is
//! floored onto the venue grid and rounded to the venue's declared decimals.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradingRules {
    pub tick_size: f64,
    pub price_decimals: u32,
    pub step_size: f64,
    pub qty_decimals: u32,
    pub min_notional: f64,
}

impl TradingRules {
    pub fn align_price(&self, price: f64) -> f64 {
        align(price, self.tick_size, self.price_decimals)
    }

    pub fn align_quantity(&self, quantity: f64) -> f64 {
        align(quantity, self.step_size, self.qty_decimals)
    }

    /// Whether an aligned order clears the venue's minimum notional.
    pub fn meets_min_notional(&self, price: f64, quantity: f64) -> bool {
        self.min_notional <= 0.0 || price * quantity >= self.min_notional
    }
}

fn align(value: f64, unit: f64, decimals: u32) -> f64 {
    if unit <= 0.0 || !value.is_finite() {
        return value;
    }
    let floored = (value / unit).floor() * unit;
    round_to(floored, decimals)
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Derive a `(unit, decimals)` pair from a venue precision field that may be
/// either a decimal count (`2`) or a unit size (`0.01`).
pub fn unit_from_precision(precision: f64) -> (f64, u32) {
    if precision >= 1.0 && precision.fract() == 0.0 {
        let decimals = precision as u32;
        (10f64.powi(-(decimals as i32)), decimals)
    } else if precision > 0.0 {
        let decimals = (-precision.log10()).round().max(0.0) as u32;
        (precision, decimals)
    } else {
        (1.0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> TradingRules {
        TradingRules {
            tick_size: 0.01,
            price_decimals: 2,
            step_size: 0.001,
            qty_decimals: 3,
            min_notional: 5.0,
        }
    }

    #[test]
    fn price_floors_onto_tick() {
        let r = rules();
        assert_eq!(r.align_price(100.4999), 100.49);
        assert_eq!(r.align_price(100.495), 100.49);
        assert_eq!(r.align_price(0.019), 0.01);
    }

    #[test]
    fn alignment_is_idempotent() {
        let r = rules();
        for p in [100.4999, 0.015, 73.333, 9999.999] {
            let once = r.align_price(p);
            assert_eq!(r.align_price(once), once);
        }
        for q in [0.00999, 1.23456, 0.0004] {
            let once = r.align_quantity(q);
            assert_eq!(r.align_quantity(once), once);
        }
    }

    #[test]
    fn quantity_floors_onto_step() {
        let r = rules();
        assert_eq!(r.align_quantity(0.00999), 0.009);
        assert_eq!(r.align_quantity(1.0), 1.0);
    }

    #[test]
    fn min_notional_gate() {
        let r = rules();
        assert!(r.meets_min_notional(100.0, 0.05));
        assert!(!r.meets_min_notional(100.0, 0.04));
    }

    #[test]
    fn precision_field_both_spellings() {
        assert_eq!(unit_from_precision(2.0), (0.01, 2));
        let (unit, decimals) = unit_from_precision(0.01);
        assert!((unit - 0.01).abs() < 1e-12);
        assert_eq!(decimals, 2);
        assert_eq!(unit_from_precision(0.0), (1.0, 0));
    }
}
