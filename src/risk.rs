//! Risk governor: position ceiling, stop-loss policy, loss-streak cooldown
//! and daily-loss cap.
//!
//! Every policy element is independently toggleable through [`RiskConfig`];
//! `can_open_position` evaluates all open-side gates atomically under one
//! mutex so a tick sees a consistent verdict.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Force-close when the adverse move reaches this percent of entry.
    pub stop_loss_percent: Option<f64>,
    /// Force-close when a position has been open this long, regardless of pnl.
    pub stop_loss_delay_seconds: Option<i64>,
    /// Losing trades inside the window required to trigger the cooldown.
    pub max_loss_count: u32,
    pub loss_window_seconds: i64,
    pub cooldown_seconds: i64,
    pub max_position_count: usize,
    /// Absolute realized loss allowed per calendar day; None disables.
    pub max_daily_loss: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_percent: None,
            stop_loss_delay_seconds: None,
            max_loss_count: 3,
            loss_window_seconds: 300,
            cooldown_seconds: 3600,
            max_position_count: 10,
            max_daily_loss: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub in_cooldown: bool,
    pub cooldown_remaining_seconds: i64,
    pub recent_losses: usize,
    pub daily_loss: f64,
}

#[derive(Debug, Default)]
struct RiskState {
    loss_trades: Vec<(DateTime<Utc>, f64)>,
    cooldown_until: Option<DateTime<Utc>>,
    daily_loss: f64,
    daily_reset_date: Option<NaiveDate>,
}

pub struct RiskGovernor {
    config: RiskConfig,
    state: Mutex<RiskState>,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RiskState {
                daily_reset_date: Some(Utc::now().date_naive()),
                ..Default::default()
            }),
        }
    }

    /// Whether a new position may be opened right now. The reason string is
    /// surfaced in logs and status snapshots.
    pub fn can_open_position(&self, current_position_count: usize) -> (bool, String) {
        let now = Utc::now();
        let mut state = self.state.lock();
        Self::reset_daily_if_needed(&mut state, now);

        if let Some(until) = state.cooldown_until {
            if now < until {
                let remaining = (until - now).num_seconds().max(0);
                return (false, format!("cooldown active, {remaining}s remaining"));
            }
            state.cooldown_until = None;
        }

        if current_position_count >= self.config.max_position_count {
            return (
                false,
                format!("position ceiling reached ({})", self.config.max_position_count),
            );
        }

        if let Some(max_daily) = self.config.max_daily_loss {
            if state.daily_loss >= max_daily {
                return (false, format!("daily loss ceiling reached ({max_daily})"));
            }
        }

        (true, "open allowed".to_string())
    }

    /// Evaluate stop-loss for one position. Returns the trigger reason, or
    /// None when the position may stay open.
    pub fn check_stop_loss(
        &self,
        entry_price: f64,
        mark_price: f64,
        is_short: bool,
        opened_at: DateTime<Utc>,
    ) -> Option<String> {
        if let Some(threshold) = self.config.stop_loss_percent {
            if entry_price > 0.0 {
                let loss_pct = if is_short {
                    (mark_price - entry_price) / entry_price * 100.0
                } else {
                    (entry_price - mark_price) / entry_price * 100.0
                };
                if loss_pct >= threshold {
                    return Some(format!("price stop-loss, down {loss_pct:.2}%"));
                }
            }
        }

        if let Some(max_age) = self.config.stop_loss_delay_seconds {
            let held = (Utc::now() - opened_at).num_seconds();
            if held >= max_age {
                return Some(format!("time stop-loss, held {held}s"));
            }
        }

        None
    }

    /// Record a realized trade result. Only losses feed the streak window
    /// and the daily accumulator.
    pub fn record_trade_result(&self, pnl: f64) {
        if pnl >= 0.0 {
            return;
        }

        let now = Utc::now();
        let mut state = self.state.lock();
        Self::reset_daily_if_needed(&mut state, now);

        state.loss_trades.push((now, pnl));
        state.daily_loss += pnl.abs();

        let cutoff = now - chrono::Duration::seconds(self.config.loss_window_seconds);
        state.loss_trades.retain(|(t, _)| *t > cutoff);

        if state.loss_trades.len() >= self.config.max_loss_count as usize {
            state.cooldown_until =
                Some(now + chrono::Duration::seconds(self.config.cooldown_seconds));
            state.loss_trades.clear();
        }
    }

    pub fn status(&self) -> RiskStatus {
        let now = Utc::now();
        let state = self.state.lock();
        let (in_cooldown, remaining) = match state.cooldown_until {
            Some(until) if now < until => (true, (until - now).num_seconds()),
            _ => (false, 0),
        };
        RiskStatus {
            in_cooldown,
            cooldown_remaining_seconds: remaining,
            recent_losses: state.loss_trades.len(),
            daily_loss: state.daily_loss,
        }
    }

    fn reset_daily_if_needed(state: &mut RiskState, now: DateTime<Utc>) {
        let today = now.date_naive();
        if state.daily_reset_date != Some(today) {
            state.daily_loss = 0.0;
            state.daily_reset_date = Some(today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(config: RiskConfig) -> RiskGovernor {
        RiskGovernor::new(config)
    }

    #[test]
    fn position_ceiling_blocks_opens() {
        let gov = governor(RiskConfig {
            max_position_count: 2,
            ..Default::default()
        });
        assert!(gov.can_open_position(1).0);
        let (allowed, reason) = gov.can_open_position(2);
        assert!(!allowed);
        assert!(reason.contains("ceiling"));
    }

    #[test]
    fn price_stop_loss_long_and_short() {
        let gov = governor(RiskConfig {
            stop_loss_percent: Some(2.0),
            ..Default::default()
        });
        let now = Utc::now();

        // Long: entry 99.5, mark 97.5 is a ~2.01% loss.
        assert!(gov.check_stop_loss(99.5, 97.5, false, now).is_some());
        assert!(gov.check_stop_loss(99.5, 99.0, false, now).is_none());

        // Short loses when the mark rises above entry.
        assert!(gov.check_stop_loss(100.0, 102.5, true, now).is_some());
        assert!(gov.check_stop_loss(100.0, 98.0, true, now).is_none());
    }

    #[test]
    fn time_stop_loss_fires_on_age() {
        let gov = governor(RiskConfig {
            stop_loss_delay_seconds: Some(60),
            ..Default::default()
        });
        let old = Utc::now() - chrono::Duration::seconds(120);
        let reason = gov.check_stop_loss(100.0, 100.0, false, old).unwrap();
        assert!(reason.contains("time stop-loss"));
        assert!(gov.check_stop_loss(100.0, 100.0, false, Utc::now()).is_none());
    }

    #[test]
    fn loss_streak_triggers_cooldown() {
        let gov = governor(RiskConfig {
            max_loss_count: 3,
            loss_window_seconds: 300,
            cooldown_seconds: 60,
            ..Default::default()
        });

        gov.record_trade_result(-1.0);
        gov.record_trade_result(-1.0);
        assert!(gov.can_open_position(0).0);

        gov.record_trade_result(-1.0);
        let (allowed, reason) = gov.can_open_position(0);
        assert!(!allowed);
        assert!(reason.contains("cooldown"));

        let status = gov.status();
        assert!(status.in_cooldown);
        assert!(status.cooldown_remaining_seconds <= 60);
        // The streak is cleared once the cooldown fires.
        assert_eq!(status.recent_losses, 0);
    }

    #[test]
    fn winning_trades_do_not_count() {
        let gov = governor(RiskConfig {
            max_loss_count: 2,
            ..Default::default()
        });
        gov.record_trade_result(5.0);
        gov.record_trade_result(5.0);
        gov.record_trade_result(-1.0);
        assert!(gov.can_open_position(0).0);
        assert_eq!(gov.status().recent_losses, 1);
    }

    #[test]
    fn daily_loss_ceiling_blocks_opens() {
        let gov = governor(RiskConfig {
            max_daily_loss: Some(10.0),
            max_loss_count: 100,
            ..Default::default()
        });
        gov.record_trade_result(-6.0);
        assert!(gov.can_open_position(0).0);
        gov.record_trade_result(-5.0);
        let (allowed, reason) = gov.can_open_position(0);
        assert!(!allowed);
        assert!(reason.contains("daily loss"));
        assert_eq!(gov.status().daily_loss, 11.0);
    }
}
