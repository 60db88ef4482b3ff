//! Coordinator store: the single cross-node dependency.
//!
//! A strategy's lock, its running-state hash, the active-worker set and the
//! task queues all live in one key-value store. Everything goes through
//! [`CoordinatorStore`] so engine and worker tests can run against an
//! in-memory double.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use tracing::debug;

pub const LOCK_TTL_SECONDS: u64 = 86_400;
pub const WORKERS_KEY: &str = "workers:active";

pub fn lock_key(strategy_id: i64) -> String {
    format!("strategy:lock:{strategy_id}")
}

pub fn running_key(strategy_id: i64) -> String {
    format!("strategy:running:{strategy_id}")
}

pub fn task_queue_key(worker: &str) -> String {
    format!("tasks:{worker}")
}

pub const TASK_QUEUE_ANY: &str = "tasks:any";

/// Initial running-state record written when a task claims a strategy.
#[derive(Debug, Clone)]
pub struct RunningInfo {
    pub task_id: String,
    pub worker_ip: String,
    pub worker_hostname: String,
    pub status: String,
}

impl RunningInfo {
    /// Hash fields, all values as base-10 strings.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let now = chrono::Utc::now().timestamp().to_string();
        vec![
            ("task_id".into(), self.task_id.clone()),
            ("worker_ip".into(), self.worker_ip.clone()),
            ("worker_hostname".into(), self.worker_hostname.clone()),
            ("status".into(), self.status.clone()),
            ("started_at".into(), now.clone()),
            ("current_price".into(), "0".into()),
            ("pending_buys".into(), "0".into()),
            ("pending_sells".into(), "0".into()),
            ("position_count".into(), "0".into()),
            ("last_error".into(), String::new()),
            ("updated_at".into(), now),
        ]
    }
}

#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    /// Compare-and-set lock with TTL. Re-acquisition by the holder is a
    /// no-op success.
    async fn acquire_lock(&self, strategy_id: i64, task_id: &str) -> Result<bool>;

    async fn release_lock(&self, strategy_id: i64) -> Result<()>;

    async fn lock_holder(&self, strategy_id: i64) -> Result<Option<String>>;

    async fn set_running_info(&self, strategy_id: i64, info: &RunningInfo) -> Result<()>;

    /// Merge fields into the running hash, stamping `updated_at`.
    async fn update_running_fields(
        &self,
        strategy_id: i64,
        fields: Vec<(String, String)>,
    ) -> Result<()>;

    async fn running_info(&self, strategy_id: i64) -> Result<Option<HashMap<String, String>>>;

    async fn clear_running_info(&self, strategy_id: i64) -> Result<()>;

    async fn register_worker(&self, worker: &str) -> Result<()>;

    async fn unregister_worker(&self, worker: &str) -> Result<()>;

    async fn active_workers(&self) -> Result<Vec<String>>;

    async fn push_task(&self, queue: &str, payload: &str) -> Result<()>;

    /// Blocking pop across queues; None on timeout.
    async fn pop_task(&self, queues: &[String], timeout_secs: f64) -> Result<Option<String>>;

    /// SET NX EX, used for notification rate-limit dedup. Returns true when
    /// the key was set (caller may proceed).
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;
}

#[derive(Clone)]
pub struct RedisCoordinator {
    manager: ConnectionManager,
}

impl RedisCoordinator {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("redis connection failed")?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl CoordinatorStore for RedisCoordinator {
    async fn acquire_lock(&self, strategy_id: i64, task_id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(LOCK_TTL_SECONDS as u64));
        let set: Option<String> = conn
            .set_options(lock_key(strategy_id), task_id, options)
            .await?;
        if set.is_some() {
            return Ok(true);
        }

        // Same holder retrying is fine.
        let holder: Option<String> = conn.get(lock_key(strategy_id)).await?;
        Ok(holder.as_deref() == Some(task_id))
    }

    async fn release_lock(&self, strategy_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.del(lock_key(strategy_id)).await?;
        Ok(())
    }

    async fn lock_holder(&self, strategy_id: i64) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(lock_key(strategy_id)).await?)
    }

    async fn set_running_info(&self, strategy_id: i64, info: &RunningInfo) -> Result<()> {
        let mut conn = self.conn();
        let fields = info.to_fields();
        let _: () = conn.hset_multiple(running_key(strategy_id), &fields).await?;
        Ok(())
    }

    async fn update_running_fields(
        &self,
        strategy_id: i64,
        mut fields: Vec<(String, String)>,
    ) -> Result<()> {
        fields.push((
            "updated_at".into(),
            chrono::Utc::now().timestamp().to_string(),
        ));
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(running_key(strategy_id), &fields).await?;
        Ok(())
    }

    async fn running_info(&self, strategy_id: i64) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.conn();
        let info: HashMap<String, String> = conn.hgetall(running_key(strategy_id)).await?;
        Ok((!info.is_empty()).then_some(info))
    }

    async fn clear_running_info(&self, strategy_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.del(running_key(strategy_id)).await?;
        Ok(())
    }

    async fn register_worker(&self, worker: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.sadd(WORKERS_KEY, worker).await?;
        debug!(worker, "worker registered");
        Ok(())
    }

    async fn unregister_worker(&self, worker: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.srem(WORKERS_KEY, worker).await?;
        Ok(())
    }

    async fn active_workers(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.smembers(WORKERS_KEY).await?)
    }

    async fn push_task(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.rpush(queue, payload).await?;
        Ok(())
    }

    async fn pop_task(&self, queues: &[String], timeout_secs: f64) -> Result<Option<String>> {
        let mut conn = self.conn();
        let result: Option<(String, String)> = conn.blpop(queues, timeout_secs).await?;
        Ok(result.map(|(_, payload)| payload))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn();
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(ttl_secs));
        let set: Option<String> = conn.set_options(key, value, options).await?;
        Ok(set.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(lock_key(7), "strategy:lock:7");
        assert_eq!(running_key(7), "strategy:running:7");
        assert_eq!(task_queue_key("worker-a"), "tasks:worker-a");
    }

    #[test]
    fn running_info_fields_are_strings() {
        let info = RunningInfo {
            task_id: "t1".into(),
            worker_ip: "10.0.0.1".into(),
            worker_hostname: "host-a".into(),
            status: "running".into(),
        };
        let fields = info.to_fields();
        let map: HashMap<_, _> = fields.into_iter().collect();
        assert_eq!(map["status"], "running");
        assert_eq!(map["pending_buys"], "0");
        assert!(map["started_at"].parse::<i64>().is_ok());
    }
}
