//! Gridbot worker process.
//!
//! Registers itself with the coordinator, consumes dispatched strategy
//! tasks from its queues and runs one trading engine per task. SIGTERM and
//! ctrl-c route into the cooperative stop signal so every engine gets to
//! run its stop discipline before the process exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridbot::engine::StopSignal;
use gridbot::exchange::registry::AdapterRegistry;
use gridbot::runtime::worker::WorkerIdentity;
use gridbot::runtime::{RedisCoordinator, WorkerRuntime};
use gridbot::util::crypto::CredentialCipher;
use gridbot::WorkerConfig;

#[derive(Debug, Parser)]
#[command(name = "gridbot-worker", about = "Grid trading strategy worker")]
struct Cli {
    /// Worker name used for queue routing; defaults to WORKER_NAME.
    #[arg(long, env = "WORKER_NAME")]
    worker_name: Option<String>,

    /// Coordinator store URL.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Directory for per-strategy trade databases.
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = WorkerConfig::from_env()?;
    if let Some(name) = cli.worker_name {
        config.worker_name = name;
    }
    if let Some(url) = cli.redis_url {
        config.redis_url = url;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    info!("gridbot worker starting name={}", config.worker_name);

    let cipher = CredentialCipher::from_hex_key(&config.encryption_key)
        .context("invalid ENCRYPTION_KEY")?;
    let store = Arc::new(
        RedisCoordinator::connect(&config.redis_url)
            .await
            .context("coordinator connection failed")?,
    );
    let registry = Arc::new(AdapterRegistry::with_builtin_venues());
    info!("registered venues: {:?}", registry.venue_ids());

    let identity = WorkerIdentity::detect(config.worker_name.clone());
    let runtime = Arc::new(WorkerRuntime::new(
        store,
        registry,
        cipher,
        identity,
        config.data_dir.clone(),
    ));

    let shutdown = StopSignal::new();
    spawn_signal_handler(shutdown.clone());

    runtime.run(shutdown).await?;
    info!("gridbot worker exited");
    Ok(())
}

fn spawn_signal_handler(shutdown: StopSignal) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("SIGTERM handler install failed: {e}");
                    if ctrl_c.await.is_ok() {
                        info!("ctrl-c received, shutting down");
                        shutdown.trigger();
                    }
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("ctrl-c received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
            shutdown.trigger();
        }

        #[cfg(not(unix))]
        {
            if ctrl_c.await.is_ok() {
                info!("ctrl-c received, shutting down");
                shutdown.trigger();
            }
        }
    });
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
