//! Typed notification events emitted by engines.
//!
//! The engine only emits; delivery fan-out (Telegram and friends) is an
//! external collaborator. Each event class carries its own rate-limit
//! window, deduplicated per (user, event, strategy) — through the
//! coordinator store when available, locally otherwise.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    OrderFilled,
    OrderFailed,
    StopLossTriggered,
    StrategyError,
    StrategyStarted,
    StrategyStopped,
}

impl NotifyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyEvent::OrderFilled => "order_filled",
            NotifyEvent::OrderFailed => "order_failed",
            NotifyEvent::StopLossTriggered => "stop_loss_triggered",
            NotifyEvent::StrategyError => "strategy_error",
            NotifyEvent::StrategyStarted => "strategy_started",
            NotifyEvent::StrategyStopped => "strategy_stopped",
        }
    }

    /// Rate-limit window in seconds; 0 means every event goes out.
    pub fn rate_limit_seconds(&self) -> i64 {
        match self {
            NotifyEvent::OrderFilled => 0,
            NotifyEvent::OrderFailed => 60,
            NotifyEvent::StopLossTriggered => 30,
            NotifyEvent::StrategyError => 60,
            NotifyEvent::StrategyStarted => 10,
            NotifyEvent::StrategyStopped => 10,
        }
    }

    /// Dedup key written with SET NX EX in the coordinator store.
    pub fn dedup_key(&self, user: &str, strategy_id: i64) -> String {
        format!("notify:rl:{user}:{}:{strategy_id}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyMessage {
    pub event: NotifyEvent,
    pub title: String,
    pub body: String,
    pub strategy_id: i64,
}

/// Local sliding-window dedup, used when no coordinator is wired in and as
/// the fallback when the store write fails.
#[derive(Default)]
pub struct LocalRateLimiter {
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LocalRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the message should be delivered.
    pub fn allow(&self, key: &str, window_seconds: i64) -> bool {
        if window_seconds <= 0 {
            return true;
        }
        let now = Utc::now();
        let mut last_sent = self.last_sent.lock();
        match last_sent.get(key) {
            Some(last) if now - *last < Duration::seconds(window_seconds) => false,
            _ => {
                last_sent.insert(key.to_string(), now);
                true
            }
        }
    }
}
