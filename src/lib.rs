//! Gridbot: distributed grid-trading worker core.
//!
//! One library, three concerns: the per-strategy trading engine, the
//! exchange adapter layer it trades through, and the coordinator runtime
//! that pins engines to workers. The binary in `main.rs` is a worker
//! process; the management API and notification fan-out live elsewhere and
//! talk to this core only through the coordinator store.

pub mod config;
pub mod domain;
pub mod engine;
pub mod exchange;
pub mod notify;
pub mod risk;
pub mod runtime;
pub mod storage;
pub mod strategy;
pub mod util;

pub use config::{AccountConfig, StrategyParams, WorkerConfig};
pub use engine::{EngineConfig, StatusSnapshot, StopSignal, TradingEngine};
pub use exchange::{ExchangeAdapter, ExchangeError};
pub use risk::{RiskConfig, RiskGovernor};
pub use runtime::{CoordinatorStore, RedisCoordinator, WorkerRuntime};
