use chrono::Utc;
use grab_core::{TaskId, TaskStatus};
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::process::{is_alive, ProcessState};
use crate::scheduler::types::RecoveryReport;

use super::Scheduler;

const SHUTDOWN_MESSAGE: &str = "terminated by scheduler shutdown";

impl Scheduler {
    /// Reconcile persisted RUNNING/CANCELLING tasks with live processes.
    /// Call once before the first cycle.
    ///
    /// Tasks whose process is still alive are adopted; the rest are marked
    /// FAILED since their outcome can no longer be observed.
    pub fn recover(&mut self) -> Result<RecoveryReport, SchedulerError> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for task in self.store.active()? {
            if self.processes.is_tracked(&task.id) {
                continue;
            }
            if let Some(pid) = task.pid.filter(|pid| is_alive(*pid)) {
                info!(task_id = %task.id, pid, "re-attached to running task");
                self.processes.adopt(task.id, pid);
                report.adopted.push(task.id);
                continue;
            }

            let message = match task.pid {
                Some(pid) => format!("process {pid} was gone when the scheduler restarted"),
                None => "scheduler restarted before the task's process was recorded".to_string(),
            };
            let result = self.store.update(&task.id, |t| {
                t.mark_failed(message.clone(), now)?;
                Ok(())
            });
            match result {
                Ok(()) => {
                    warn!(task_id = %task.id, pid = ?task.pid, "orphaned task marked failed");
                    self.record_finished(TaskStatus::Failed);
                    report.failed.push(task.id);
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "could not reconcile task"),
            }
        }

        if !report.adopted.is_empty() || !report.failed.is_empty() {
            info!(
                adopted = report.adopted.len(),
                failed = report.failed.len(),
                "recovered tasks from previous run"
            );
        }
        Ok(report)
    }

    /// Shutdown handling for owned processes, called when `run` exits.
    ///
    /// With `kill_on_shutdown` every process is terminated and its task
    /// finalized; otherwise processes keep running for the next instance.
    pub fn stop(&mut self) -> Vec<(TaskId, TaskStatus)> {
        if !self.config.kill_on_shutdown {
            if !self.processes.is_empty() {
                info!(
                    tasks = self.processes.len(),
                    "leaving task processes running for the next scheduler"
                );
            }
            return Vec::new();
        }

        let exits = self.processes.shutdown(self.config.termination_grace);
        let now = Utc::now();
        let mut finished = Vec::with_capacity(exits.len());
        for (id, state) in exits {
            let result = self.store.update(&id, |t| {
                match (t.status(), state) {
                    (TaskStatus::Cancelling, ProcessState::Exited(code)) => t.mark_exited(code, now)?,
                    (TaskStatus::Cancelling, _) => {
                        t.transition(TaskStatus::Cancelled)?;
                        t.finished_at = Some(now);
                    }
                    (_, ProcessState::Exited(0)) => t.mark_exited(0, now)?,
                    (_, ProcessState::Exited(code)) => {
                        t.mark_failed(SHUTDOWN_MESSAGE, now)?;
                        t.exit_code = Some(code);
                    }
                    _ => t.mark_failed(SHUTDOWN_MESSAGE, now)?,
                }
                Ok(t.status())
            });
            match result {
                Ok(status) => {
                    info!(task_id = %id, %status, "task stopped at shutdown");
                    self.record_finished(status);
                    finished.push((id, status));
                }
                Err(e) => warn!(task_id = %id, error = %e, "could not record task stop"),
            }
        }
        finished
    }
}
