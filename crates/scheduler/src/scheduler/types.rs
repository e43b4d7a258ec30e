use std::path::PathBuf;
use std::time::Duration;

use grab_core::{GrabConfig, TaskId, TaskStatus};
use serde::Serialize;

/// Minimum spacing between two retention sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Scheduler settings, fixed for the lifetime of a [`Scheduler`](super::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between two cycles.
    pub check_interval: Duration,
    /// Upper bound on RUNNING tasks.
    pub max_concurrent_tasks: usize,
    /// Time between SIGTERM and SIGKILL.
    pub termination_grace: Duration,
    /// Terminal tasks older than this are removed from the store.
    /// `None` keeps them forever.
    pub retention: Option<chrono::Duration>,
    /// Stop owned processes when the scheduler exits instead of leaving
    /// them for the next instance to adopt.
    pub kill_on_shutdown: bool,
    pub logs_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&GrabConfig::default())
    }
}

impl From<&GrabConfig> for SchedulerConfig {
    fn from(config: &GrabConfig) -> Self {
        Self {
            check_interval: config.check_interval(),
            max_concurrent_tasks: config.max_concurrent_tasks,
            termination_grace: config.termination_grace(),
            retention: (config.retention_days > 0)
                .then(|| chrono::Duration::days(i64::from(config.retention_days))),
            kill_on_shutdown: config.kill_on_shutdown,
            logs_dir: config.logs_dir(),
        }
    }
}

/// Why the admission phase of a cycle did not run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionSkip {
    AtCapacity,
    MonitorUnavailable(String),
}

/// What one scheduling cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// CANCELLING tasks that were sent SIGTERM this cycle.
    pub signalled: Vec<TaskId>,
    /// Tasks that reached a terminal status while being reaped.
    pub finished: Vec<(TaskId, TaskStatus)>,
    pub admitted: Vec<(TaskId, Vec<u32>)>,
    pub launch_failures: Vec<TaskId>,
    pub skipped: Option<AdmissionSkip>,
    /// Expired tasks removed by the retention sweep.
    pub cleaned: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.signalled.is_empty()
            && self.finished.is_empty()
            && self.admitted.is_empty()
            && self.launch_failures.is_empty()
            && self.cleaned == 0
    }
}

/// Outcome of reconciling persisted state with live processes at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Tasks whose process is still alive and is now tracked again.
    pub adopted: Vec<TaskId>,
    /// Tasks marked FAILED because their process is gone.
    pub failed: Vec<TaskId>,
}
