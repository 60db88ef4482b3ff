//! Worker runtime: consumes dispatched strategy tasks and runs one engine
//! per task to completion.
//!
//! Task lifecycle: acquire the distributed lock (contention rejects without
//! requeue), write the running hash, decrypt credentials, build the adapter
//! through the venue registry, run the engine, and always release the lock
//! and clear the hash on the way out — whatever the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{AccountConfig, RuntimeParams, StrategyParams};
use crate::engine::{EngineConfig, StatusSnapshot, StopSignal, TradingEngine};
use crate::exchange::registry::{AdapterParams, AdapterRegistry};
use crate::notify::{LocalRateLimiter, NotifyEvent, NotifyMessage};
use crate::risk::RiskGovernor;
use crate::storage::TradeStore;
use crate::strategy::build_strategy;
use crate::util::crypto::CredentialCipher;
use crate::util::log_prefix::make_log_prefix;

use super::coordinator::{task_queue_key, CoordinatorStore, RunningInfo, TASK_QUEUE_ANY};

const TASK_POLL_TIMEOUT_SECS: f64 = 5.0;
const STOP_WATCH_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_COALESCE_INTERVAL: Duration = Duration::from_secs(1);

/// A dispatched start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub strategy_id: i64,
    pub account: AccountConfig,
    pub strategy: StrategyParams,
    #[serde(default)]
    pub runtime: RuntimeParams,
}

#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub name: String,
    pub ip: String,
    pub hostname: String,
}

impl WorkerIdentity {
    pub fn detect(name: String) -> Self {
        Self {
            name,
            ip: detect_local_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
            hostname: detect_hostname().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

fn detect_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

fn detect_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
}

/// Long-lived worker process state: the dispatch loop plus the stop signals
/// of every engine it is currently running.
pub struct WorkerRuntime {
    store: Arc<dyn CoordinatorStore>,
    registry: Arc<AdapterRegistry>,
    cipher: CredentialCipher,
    identity: WorkerIdentity,
    data_dir: String,
    active: Arc<Mutex<HashMap<i64, StopSignal>>>,
}

impl WorkerRuntime {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        registry: Arc<AdapterRegistry>,
        cipher: CredentialCipher,
        identity: WorkerIdentity,
        data_dir: String,
    ) -> Self {
        Self {
            store,
            registry,
            cipher,
            identity,
            data_dir,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume the dispatch queues until `shutdown` fires, then stop every
    /// running engine and deregister.
    pub async fn run(self: Arc<Self>, shutdown: StopSignal) -> Result<()> {
        self.store.register_worker(&self.identity.name).await?;
        info!(
            "worker {} ({} / {}) consuming tasks",
            self.identity.name, self.identity.hostname, self.identity.ip
        );

        let queues = vec![
            task_queue_key(&self.identity.name),
            TASK_QUEUE_ANY.to_string(),
        ];

        while !shutdown.is_triggered() {
            let payload = match self.store.pop_task(&queues, TASK_POLL_TIMEOUT_SECS).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!("task queue poll failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let task: TaskPayload = match serde_json::from_str(&payload) {
                Ok(task) => task,
                Err(e) => {
                    error!("undecodable task payload dropped: {e}");
                    continue;
                }
            };

            let runtime = self.clone();
            tokio::spawn(async move {
                let strategy_id = task.strategy_id;
                if let Err(e) = runtime.execute(task).await {
                    error!("strategy {strategy_id} task failed: {e}");
                }
            });
        }

        info!("worker {} shutting down, stopping engines", self.identity.name);
        let signals: Vec<StopSignal> = self.active.lock().values().cloned().collect();
        for signal in signals {
            signal.trigger();
        }
        // Give engines a moment to run their stop discipline.
        for _ in 0..50 {
            if self.active.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.store.unregister_worker(&self.identity.name).await?;
        Ok(())
    }

    async fn execute(&self, task: TaskPayload) -> Result<()> {
        let stop_signal = StopSignal::new();
        self.active
            .lock()
            .insert(task.strategy_id, stop_signal.clone());

        let result = run_strategy_task(
            self.store.clone(),
            self.registry.clone(),
            &self.cipher,
            &self.identity,
            &self.data_dir,
            task.clone(),
            stop_signal,
        )
        .await;

        self.active.lock().remove(&task.strategy_id);
        result
    }
}

/// Run one strategy task to completion. See the module docs for the
/// lifecycle contract.
pub async fn run_strategy_task(
    store: Arc<dyn CoordinatorStore>,
    registry: Arc<AdapterRegistry>,
    cipher: &CredentialCipher,
    identity: &WorkerIdentity,
    data_dir: &str,
    task: TaskPayload,
    stop_signal: StopSignal,
) -> Result<()> {
    let strategy_id = task.strategy_id;
    let task_id = Uuid::new_v4().to_string();

    if !store.acquire_lock(strategy_id, &task_id).await? {
        let holder = store.lock_holder(strategy_id).await?.unwrap_or_default();
        bail!("strategy {strategy_id} already running (task_id: {holder})");
    }

    store
        .set_running_info(
            strategy_id,
            &RunningInfo {
                task_id: task_id.clone(),
                worker_ip: identity.ip.clone(),
                worker_hostname: identity.hostname.clone(),
                status: "running".into(),
            },
        )
        .await?;
    info!(
        "starting strategy {strategy_id} on worker {} ({}), task_id={task_id}",
        identity.hostname, identity.ip
    );

    let outcome = run_engine(
        store.clone(),
        registry,
        cipher,
        data_dir,
        &task,
        stop_signal,
    )
    .await;

    if let Err(e) = &outcome {
        let _ = store
            .update_running_fields(
                strategy_id,
                vec![
                    ("status".into(), "error".into()),
                    ("last_error".into(), e.to_string()),
                ],
            )
            .await;
    }

    let _ = store.release_lock(strategy_id).await;
    let _ = store.clear_running_info(strategy_id).await;
    info!("strategy {strategy_id} stopped and cleaned up");
    outcome
}

async fn run_engine(
    store: Arc<dyn CoordinatorStore>,
    registry: Arc<AdapterRegistry>,
    cipher: &CredentialCipher,
    data_dir: &str,
    task: &TaskPayload,
    stop_signal: StopSignal,
) -> Result<()> {
    let strategy_id = task.strategy_id;

    let api_key = cipher
        .decrypt(&task.account.api_key)
        .context("api key decryption failed")?;
    let api_secret = cipher
        .decrypt(&task.account.api_secret)
        .context("api secret decryption failed")?;

    let adapter = registry
        .build(AdapterParams {
            venue_id: task.account.venue_id.clone(),
            api_key: api_key.clone(),
            api_secret,
            symbol: task.strategy.symbol.clone(),
            testnet: task.account.testnet,
        })
        .await
        .map_err(|e| anyhow!("adapter construction failed: {e}"))?;

    let strategy = build_strategy(task.strategy.kind, task.strategy.strategy_config());
    let risk = Arc::new(RiskGovernor::new(task.strategy.risk_config()));
    let trade_store = Arc::new(
        TradeStore::open(
            format!("{data_dir}/trades_{strategy_id}.db"),
            strategy_id,
        )
        .context("trade store open failed")?,
    );

    let log_prefix = make_log_prefix(&task.strategy.symbol, &api_key, &task.account.venue_id);
    let engine = TradingEngine::new(
        EngineConfig {
            strategy_id,
            ..EngineConfig::default()
        },
        strategy,
        adapter,
        risk,
        Some(trade_store),
        log_prefix,
        stop_signal.clone(),
    );

    wire_status_updates(store.clone(), strategy_id, &engine);
    wire_notifications(store.clone(), strategy_id, task.runtime.user_email.clone(), &engine);
    spawn_stop_watcher(store.clone(), strategy_id, stop_signal.clone());

    notify_event(
        &store,
        strategy_id,
        task.runtime.user_email.clone(),
        NotifyEvent::StrategyStarted,
        format!("strategy {strategy_id} started"),
    )
    .await;

    let run_result = engine.run().await;
    let _ = store
        .update_running_fields(strategy_id, vec![("status".into(), "stopping".into())])
        .await;
    engine.stop().await;

    notify_event(
        &store,
        strategy_id,
        task.runtime.user_email.clone(),
        NotifyEvent::StrategyStopped,
        format!("strategy {strategy_id} stopped"),
    )
    .await;

    run_result
}

/// Status snapshots flow through a channel into the coordinator hash,
/// coalesced to roughly one write per second.
fn wire_status_updates(
    store: Arc<dyn CoordinatorStore>,
    strategy_id: i64,
    engine: &Arc<TradingEngine>,
) {
    let (tx, mut rx) = mpsc::channel::<StatusSnapshot>(32);
    engine.set_status_callback(Arc::new(move |snapshot| {
        // Drop on backpressure; a fresher snapshot is always coming.
        let _ = tx.try_send(snapshot);
    }));

    tokio::spawn(async move {
        let mut last_write: Option<tokio::time::Instant> = None;
        while let Some(mut snapshot) = rx.recv().await {
            // Coalesce: drain whatever queued behind this one.
            while let Ok(newer) = rx.try_recv() {
                snapshot = newer;
            }
            if let Some(at) = last_write {
                let since_last = at.elapsed();
                if since_last < STATUS_COALESCE_INTERVAL {
                    tokio::time::sleep(STATUS_COALESCE_INTERVAL - since_last).await;
                    while let Ok(newer) = rx.try_recv() {
                        snapshot = newer;
                    }
                }
            }
            last_write = Some(tokio::time::Instant::now());

            let fields = snapshot_fields(&snapshot);
            if let Err(e) = store.update_running_fields(strategy_id, fields).await {
                warn!("strategy {strategy_id} status write failed: {e}");
            }
        }
    });
}

/// Running-hash fields for a snapshot; numbers as base-10 strings.
fn snapshot_fields(snapshot: &StatusSnapshot) -> Vec<(String, String)> {
    let mut fields = vec![
        (
            "current_price".into(),
            snapshot
                .current_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "0".into()),
        ),
        ("pending_buys".into(), snapshot.pending_buys.to_string()),
        ("pending_sells".into(), snapshot.pending_sells.to_string()),
        (
            "position_count".into(),
            snapshot.position_count.to_string(),
        ),
        (
            "last_error".into(),
            snapshot.last_error.clone().unwrap_or_default(),
        ),
        ("exchange".into(), snapshot.exchange.clone()),
    ];
    if !snapshot.extra.is_empty() {
        if let Ok(extra) = serde_json::to_string(&snapshot.extra) {
            fields.push(("extra_status".into(), extra));
        }
    }
    fields
}

fn wire_notifications(
    store: Arc<dyn CoordinatorStore>,
    strategy_id: i64,
    user_email: Option<String>,
    engine: &Arc<TradingEngine>,
) {
    let limiter = Arc::new(LocalRateLimiter::new());
    let (tx, mut rx) = mpsc::channel::<NotifyMessage>(64);
    engine.set_notify_callback(Arc::new(move |event, title, body| {
        let _ = tx.try_send(NotifyMessage {
            event,
            title,
            body,
            strategy_id,
        });
    }));

    tokio::spawn(async move {
        let user = user_email.unwrap_or_else(|| "-".to_string());
        while let Some(message) = rx.recv().await {
            let window = message.event.rate_limit_seconds();
            let key = message.event.dedup_key(&user, message.strategy_id);

            let allowed = if window <= 0 {
                true
            } else {
                match store.set_nx_ex(&key, "1", window as u64).await {
                    Ok(set) => set,
                    // Store down: fall back to the local window.
                    Err(_) => limiter.allow(&key, window),
                }
            };
            if allowed {
                info!(
                    event = message.event.as_str(),
                    strategy_id = message.strategy_id,
                    "{}: {}",
                    message.title,
                    message.body
                );
            }
        }
    });
}

/// Watch the running hash for a cooperative stop request from the API.
fn spawn_stop_watcher(
    store: Arc<dyn CoordinatorStore>,
    strategy_id: i64,
    stop_signal: StopSignal,
) {
    tokio::spawn(async move {
        loop {
            if stop_signal.is_triggered() {
                return;
            }
            match store.running_info(strategy_id).await {
                Ok(Some(info)) => {
                    if info.get("status").map(String::as_str) == Some("stopping") {
                        info!("strategy {strategy_id} stop requested via coordinator");
                        stop_signal.trigger();
                        return;
                    }
                }
                // A cleared hash means the task is being torn down.
                Ok(None) => return,
                Err(e) => warn!("strategy {strategy_id} stop watch failed: {e}"),
            }
            tokio::time::sleep(STOP_WATCH_INTERVAL).await;
        }
    });
}

async fn notify_event(
    store: &Arc<dyn CoordinatorStore>,
    strategy_id: i64,
    user_email: Option<String>,
    event: NotifyEvent,
    body: String,
) {
    let user = user_email.unwrap_or_else(|| "-".to_string());
    let window = event.rate_limit_seconds();
    let allowed = if window <= 0 {
        true
    } else {
        store
            .set_nx_ex(&event.dedup_key(&user, strategy_id), "1", window as u64)
            .await
            .unwrap_or(true)
    };
    if allowed {
        info!(event = event.as_str(), strategy_id, "{body}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_payload_decodes() {
        let json = serde_json::json!({
            "strategy_id": 7,
            "account": {
                "venue_id": "binance",
                "api_key": "enc-key",
                "api_secret": "enc-secret",
                "testnet": true
            },
            "strategy": {
                "symbol": "BTCUSDT",
                "kind": "grid",
                "base_order_size": 0.01,
                "buy_price_deviation": 0.5,
                "sell_price_deviation": 1.0,
                "grid_levels": 1
            }
        });
        let task: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(task.strategy_id, 7);
        assert_eq!(task.account.venue_id, "binance");
        assert!(task.runtime.user_email.is_none());
    }

    #[test]
    fn snapshot_fields_stringify_numbers() {
        let snapshot = StatusSnapshot {
            exchange: "binance".into(),
            current_price: Some(99.5),
            pending_buys: 2,
            pending_sells: 1,
            position_count: 3,
            buy_orders: vec![],
            sell_orders: vec![],
            last_error: None,
            extra: serde_json::Map::new(),
        };
        let fields: HashMap<_, _> = snapshot_fields(&snapshot).into_iter().collect();
        assert_eq!(fields["current_price"], "99.5");
        assert_eq!(fields["pending_buys"], "2");
        assert_eq!(fields["last_error"], "");
    }
}
