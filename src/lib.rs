pub mod config;
pub mod dispatch;
pub mod http;
pub mod supervisor;
pub mod task;
pub mod topology;
pub mod worktree;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::cache::DEFAULT_TTL;
use crate::config::{AgentIdentity, ConfigCache};
use crate::dispatch::{DispatchMonitor, MemoryStore, MonitorConfig, SharedStore, StoreKeys, TaskQueue};
use crate::http::state::AppState;
use crate::supervisor::HostProcessSupervisor;
use crate::task::TaskManager;

/// Overrides the `.hive` control directory.
pub const HIVE_DIR_ENV: &str = "HIVE_DIR";

pub fn run() -> std::io::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_until_interrupted())
}

async fn run_until_interrupted() -> std::io::Result<()> {
    let hive_dir = std::env::var_os(HIVE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".hive"));
    let config = Arc::new(ConfigCache::new(hive_dir.join("hive.yaml"), DEFAULT_TTL));
    let settings = config.get();
    if let Err(e) = settings.validate() {
        tracing::warn!("hive.yaml is invalid, continuing anyway: {}", e);
    }

    let identity = AgentIdentity::from_env();
    tracing::info!("Starting as {} ({})", identity.name, identity.role);

    // Create shared state
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let queue = Arc::new(TaskQueue::new(store, StoreKeys::new(settings.redis.key_prefix.clone())));
    let monitor = Arc::new(DispatchMonitor::new(
        Arc::clone(&queue),
        identity.clone(),
        MonitorConfig::for_identity(&settings, &identity),
    ));
    let tasks = Arc::new(TaskManager::new());
    let supervisor = Arc::new(HostProcessSupervisor::new(&hive_dir));
    let shutdown = CancellationToken::new();

    if identity.is_queen() {
        if let Err(e) = settings.write_env_generated(&hive_dir) {
            tracing::warn!("Failed to write environment file: {}", e);
        }
        if let Err(e) = supervisor.start_all(&settings.host_mcps).await {
            tracing::error!("Host capability servers: {}", e);
        }
    }

    let monitoring = if identity.is_queen() {
        settings.monitoring.queen.enabled
    } else {
        settings.monitoring.worker.enabled
    };
    if monitoring {
        monitor.start().await;
    }

    let relay = spawn_task_event_relay(&tasks, Arc::clone(&queue), shutdown.clone());

    // Start HTTP server if enabled
    let server = if settings.api.enabled {
        let port = settings.api.port;
        tracing::info!("Starting HTTP API on port {}", port);
        let state = Arc::new(AppState::new(
            Arc::clone(&config),
            identity.clone(),
            Arc::clone(&tasks),
            Arc::clone(&queue),
            Arc::clone(&monitor),
            Arc::clone(&supervisor),
        ));
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(state, port).await {
                tracing::error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    shutdown.cancel();
    monitor.stop().await;
    if let Err(e) = supervisor.stop_all().await {
        tracing::warn!("Failed to stop host capability servers: {}", e);
    }
    if let Some(server) = server {
        server.abort();
    }
    let _ = relay.await;
    Ok(())
}

/// Publishes every task lifecycle event on the events channel so monitors see
/// them alongside drone traffic.
fn spawn_task_event_relay(
    tasks: &TaskManager,
    queue: Arc<TaskQueue>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut events = tasks.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    if let Err(e) = queue.publish_task_event(&event).await {
                        tracing::warn!("Failed to relay task event: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Task event relay skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
