//! Worker configuration and the task payload schema.
//!
//! A start request travels through the task queue as JSON: the strategy
//! row, the account row (credentials still encrypted) and an optional
//! runtime blob. The worker turns these into engine-ready configs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::risk::RiskConfig;
use crate::strategy::{StrategyConfig, StrategyKind};

/// Worker process configuration, resolved from the environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_name: String,
    pub redis_url: String,
    /// Directory for per-strategy trade databases.
    pub data_dir: String,
    /// 64-hex-char AES-256 key for credential decryption.
    pub encryption_key: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let worker_name = std::env::var("WORKER_NAME").unwrap_or_else(|_| {
            format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8])
        });
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| ".".to_string());
        let encryption_key =
            std::env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY must be set (64 hex chars)")?;

        Ok(Self {
            worker_name,
            redis_url,
            data_dir,
            encryption_key,
        })
    }
}

/// Exchange account row as it arrives in the task payload; secrets stay
/// encrypted until adapter construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub venue_id: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
}

/// Strategy row fields the engine consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    pub symbol: String,
    pub kind: StrategyKind,
    pub base_order_size: f64,
    pub buy_price_deviation: f64,
    pub sell_price_deviation: f64,
    pub grid_levels: u32,
    #[serde(default = "default_polling_interval")]
    pub polling_interval: f64,
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub stop_loss_delay: Option<i64>,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default)]
    pub max_daily_drawdown: Option<f64>,
}

fn default_polling_interval() -> f64 {
    1.0
}

fn default_price_tolerance() -> f64 {
    0.5
}

fn default_max_open_positions() -> usize {
    10
}

impl StrategyParams {
    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig {
            symbol: self.symbol.clone(),
            quantity: self.base_order_size,
            offset_percent: self.buy_price_deviation,
            sell_offset_percent: self.sell_price_deviation,
            grid_levels: self.grid_levels,
            interval: self.polling_interval,
            reprice_threshold: self.price_tolerance,
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            stop_loss_percent: self.stop_loss,
            stop_loss_delay_seconds: self.stop_loss_delay,
            max_position_count: self.max_open_positions,
            max_daily_loss: self.max_daily_drawdown,
            ..RiskConfig::default()
        }
    }
}

/// Optional runtime blob attached by the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeParams {
    #[serde(default)]
    pub user_email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_params_round_trip() {
        let json = serde_json::json!({
            "symbol": "BTCUSDT",
            "kind": "grid",
            "base_order_size": 0.01,
            "buy_price_deviation": 0.5,
            "sell_price_deviation": 1.0,
            "grid_levels": 3,
            "stop_loss": 2.0
        });
        let params: StrategyParams = serde_json::from_value(json).unwrap();
        assert_eq!(params.kind, StrategyKind::Grid);
        assert_eq!(params.polling_interval, 1.0);
        assert_eq!(params.max_open_positions, 10);

        let config = params.strategy_config();
        assert_eq!(config.quantity, 0.01);
        assert_eq!(config.grid_levels, 3);

        let risk = params.risk_config();
        assert_eq!(risk.stop_loss_percent, Some(2.0));
        assert_eq!(risk.max_position_count, 10);
    }
}
