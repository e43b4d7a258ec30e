use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::TaskStatus;

/// Scheduler operational counters, shared read-only with the daemon's
/// status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Completed scheduling cycles.
    pub cycles: u64,
    /// Tasks moved PENDING -> RUNNING.
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Spawn failures (subset of `failed`).
    pub launch_failures: u64,
    /// Cycles whose admission phase was skipped because telemetry failed.
    pub monitor_errors: u64,
    /// Tasks the scheduler currently tracks as RUNNING or CANCELLING.
    pub active_tasks: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    /// Record a task reaching a terminal status.
    pub fn record_finished(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            _ => {}
        }
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> f64 {
        self.started_at
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_finished_counts_terminal_only() {
        let mut m = SchedulerMetrics::default();
        m.record_finished(TaskStatus::Completed);
        m.record_finished(TaskStatus::Failed);
        m.record_finished(TaskStatus::Failed);
        m.record_finished(TaskStatus::Running);

        assert_eq!(m.completed, 1);
        assert_eq!(m.failed, 2);
        assert_eq!(m.cancelled, 0);
    }

    #[test]
    fn uptime_without_start_is_zero() {
        let m = SchedulerMetrics::default();
        assert_eq!(m.uptime_seconds(Utc::now()), 0.0);
    }
}
