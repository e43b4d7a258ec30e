//! Daemon lifecycle: open state, recover, run the scheduler thread and the
//! socket server, then tear both down.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use grab_core::GrabConfig;
use grab_queue::TaskStore;
use grab_scheduler::{ResourceMonitor, Scheduler, SchedulerConfig};
use tracing::{info, warn};

use crate::server;
use crate::state::DaemonState;

/// Run until `shutdown` resolves.
///
/// Startup fails when the store is corrupt, when telemetry cannot be read
/// or when the socket is held by a live daemon.
pub async fn run_daemon(
    config: GrabConfig,
    monitor: Arc<dyn ResourceMonitor>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let data_dir = config.data_dir();
    let store = Arc::new(
        TaskStore::open(&data_dir)
            .with_context(|| format!("opening task store in {}", data_dir.display()))?,
    );

    let gpus = {
        let monitor = Arc::clone(&monitor);
        tokio::task::spawn_blocking(move || monitor.sample())
            .await
            .context("startup gpu sample panicked")?
            .context("initial gpu sample failed")?
    };
    info!(gpus = gpus.len(), "gpu telemetry available");
    for gpu in &gpus {
        info!(
            index = gpu.index,
            name = %gpu.name,
            free_gb = %format!("{:.1}", gpu.free_memory_gb()),
            util = gpu.utilization_percent,
            "gpu"
        );
    }

    // Refuse to run next to a live daemon before touching task state.
    let socket_path = config.socket_path();
    let listener = server::bind(&socket_path).await?;

    let mut scheduler = Scheduler::new(
        SchedulerConfig::from(&config),
        Arc::clone(&store),
        Arc::clone(&monitor),
    );
    if let Err(e) = scheduler.recover() {
        let _ = std::fs::remove_file(&socket_path);
        return Err(e).context("recovering tasks from previous run");
    }

    let state = Arc::new(DaemonState {
        metrics: scheduler.metrics_handle(),
        shutdown: scheduler.shutdown_signal(),
        config,
        store,
        monitor,
    });

    let stop_flag = scheduler.shutdown_signal();
    let worker = std::thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || scheduler.run())
        .context("starting scheduler thread")?;

    let served = server::serve(listener, Arc::clone(&state), shutdown).await;

    stop_flag.store(true, Ordering::Relaxed);
    info!("waiting for scheduler to stop");
    let joined = tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("joining scheduler thread")?;
    if joined.is_err() {
        warn!("scheduler thread panicked");
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(path = %socket_path.display(), error = %e, "could not remove socket");
    }
    info!("daemon stopped");

    served?;
    joined.map_err(|_| anyhow!("scheduler thread panicked"))
}
