pub mod event_bus;
pub mod position_syncer;
pub mod trading_engine;

pub use event_bus::{Event, EventBus, EventType};
pub use position_syncer::PositionSyncer;
pub use trading_engine::{
    EngineConfig, NotifyCallback, StatusCallback, StatusSnapshot, StopSignal, TradingEngine,
};
