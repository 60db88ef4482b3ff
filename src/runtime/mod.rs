pub mod coordinator;
pub mod worker;

pub use coordinator::{
    CoordinatorStore, RedisCoordinator, RunningInfo, LOCK_TTL_SECONDS, WORKERS_KEY,
};
pub use worker::{run_strategy_task, TaskPayload, WorkerIdentity, WorkerRuntime};
