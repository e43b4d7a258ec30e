use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use grab_core::{SchedulerMetrics, Task, TaskStatus};
use grab_queue::TaskStore;
use tracing::{info, warn};

use crate::monitor::ResourceMonitor;
use crate::process::{is_alive, ProcessManager};
use crate::scheduler::types::SchedulerConfig;

/// The GPU scheduler. Admits queued tasks onto free devices and tracks
/// their processes until they finish.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) store: Arc<TaskStore>,
    pub(super) monitor: Arc<dyn ResourceMonitor>,
    /// Handles of every process launched or adopted by this instance.
    pub(super) processes: ProcessManager,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(super) shutdown: Arc<AtomicBool>,
    pub(super) last_cleanup: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<TaskStore>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Self {
        let processes = ProcessManager::new(config.logs_dir.clone());
        let metrics = SchedulerMetrics {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        Self {
            config,
            store,
            monitor,
            processes,
            metrics: Arc::new(RwLock::new(metrics)),
            shutdown: Arc::new(AtomicBool::new(false)),
            last_cleanup: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Signal the scheduler to stop after the current cycle.
    pub fn shutdown(&self) {
        info!("scheduler shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Get an Arc to the shutdown flag (for external shutdown signaling).
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// Make sure a RUNNING/CANCELLING task has a handle, adopting its
    /// process by pid if it outlived a previous instance. False when the
    /// process is gone.
    pub(super) fn ensure_tracked(&mut self, task: &Task) -> bool {
        if self.processes.is_tracked(&task.id) {
            return true;
        }
        match task.pid {
            Some(pid) if is_alive(pid) => {
                self.processes.adopt(task.id, pid);
                true
            }
            _ => false,
        }
    }

    pub(super) fn with_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        match self.metrics.write() {
            Ok(mut m) => f(&mut m),
            Err(e) => warn!(error = %e, "scheduler metrics lock poisoned"),
        }
    }

    pub(super) fn record_finished(&self, status: TaskStatus) {
        self.with_metrics(|m| m.record_finished(status));
    }
}
