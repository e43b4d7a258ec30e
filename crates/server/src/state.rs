use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use grab_core::{GrabConfig, SchedulerMetrics};
use grab_queue::TaskStore;
use grab_scheduler::ResourceMonitor;

/// Everything a connection handler needs, shared across connections.
pub struct DaemonState {
    pub config: GrabConfig,
    pub store: Arc<TaskStore>,
    pub monitor: Arc<dyn ResourceMonitor>,
    pub metrics: Arc<RwLock<SchedulerMetrics>>,
    /// Set once the scheduler has been asked to stop.
    pub shutdown: Arc<AtomicBool>,
}

impl DaemonState {
    pub fn scheduler_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    pub fn metrics_snapshot(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}
