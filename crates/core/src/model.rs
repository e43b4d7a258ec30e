use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

pub type TaskId = Uuid;

/// First eight hex characters of a task id, as shown in listings.
pub fn short_id(id: &TaskId) -> String {
    id.simple().to_string()[..8].to_string()
}

// ── Task status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Cancelling,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a subprocess may exist for a task in this status.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Cancelling)
    }

    /// The scheduler state machine.
    ///
    /// `Pending -> Failed` covers launch failures and `Cancelling -> Failed`
    /// covers processes whose outcome was lost across a daemon restart.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown task status: {s}")))
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Result of a cancel request against a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Was pending; now cancelled.
    Cancelled,
    /// Was running; termination requested, not yet confirmed.
    Cancelling,
    /// Already terminal or already cancelling. Carries the current status.
    NotCancellable(TaskStatus),
}

impl CancelOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, CancelOutcome::NotCancellable(_))
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            CancelOutcome::Cancelled => TaskStatus::Cancelled,
            CancelOutcome::Cancelling => TaskStatus::Cancelling,
            CancelOutcome::NotCancellable(status) => *status,
        }
    }
}

// ── Resource requirement ──────────────────────────────────────

/// Accelerator resources a task needs before it may be admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// Restrict placement to these device indices. Empty means any device.
    #[serde(default)]
    pub gpu_ids: Vec<u32>,
    #[serde(default)]
    pub min_free_memory_gb: f64,
    #[serde(default = "default_max_util")]
    pub max_util_percent: f64,
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
}

fn default_max_util() -> f64 {
    100.0
}

fn default_gpu_count() -> u32 {
    1
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            gpu_ids: Vec::new(),
            min_free_memory_gb: 0.0,
            max_util_percent: default_max_util(),
            gpu_count: default_gpu_count(),
        }
    }
}

impl ResourceRequirement {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.gpu_count == 0 {
            return Err(CoreError::InvalidInput("gpu_count must be at least 1".into()));
        }
        if !self.min_free_memory_gb.is_finite() || self.min_free_memory_gb < 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "min_free_memory_gb must be a non-negative number, got {}",
                self.min_free_memory_gb
            )));
        }
        if !(0.0..=100.0).contains(&self.max_util_percent) {
            return Err(CoreError::InvalidInput(format!(
                "max_util_percent must be within 0-100, got {}",
                self.max_util_percent
            )));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.gpu_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(CoreError::InvalidInput(format!("gpu id {dup} listed more than once")));
        }
        if !self.gpu_ids.is_empty() && (self.gpu_ids.len() as u32) < self.gpu_count {
            return Err(CoreError::InvalidInput(format!(
                "gpu_count {} exceeds the {} requested gpu ids",
                self.gpu_count,
                self.gpu_ids.len()
            )));
        }
        Ok(())
    }
}

// ── Resource status ───────────────────────────────────────────

/// Point-in-time telemetry for one accelerator. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub index: u32,
    pub name: String,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub free_memory_mb: u64,
    pub utilization_percent: f64,
    pub temperature: u32,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceStatus {
    pub fn free_memory_gb(&self) -> f64 {
        self.free_memory_mb as f64 / 1024.0
    }

    pub fn is_idle(&self) -> bool {
        self.utilization_percent < 5.0
    }
}

// ── Task ──────────────────────────────────────────────────────

/// Fields supplied by a submitter. Everything else is owned by the store
/// and the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub requirements: ResourceRequirement,
    #[serde(default)]
    pub priority: i64,
}

impl NewTask {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.command.trim().is_empty() {
            return Err(CoreError::InvalidInput("command must not be empty".into()));
        }
        self.requirements.validate()
    }
}

/// A unit of submitted work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub requirements: ResourceRequirement,
    #[serde(default)]
    pub priority: i64,
    status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_gpus: Vec<u32>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Task {
    /// Build a fresh PENDING task.
    pub fn new(id: TaskId, spec: NewTask, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            command: spec.command,
            working_dir: spec.working_dir,
            env: spec.env,
            requirements: spec.requirements,
            priority: spec.priority,
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            assigned_gpus: Vec::new(),
            pid: None,
            exit_code: None,
            error_message: None,
            log_file: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn short_id(&self) -> String {
        short_id(&self.id)
    }

    /// Name if one was given, otherwise the short id.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.short_id()
        } else {
            self.name.clone()
        }
    }

    /// Move to `next`, rejecting edges outside the state machine.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Admission: PENDING -> RUNNING.
    pub fn mark_running(
        &mut self,
        pid: u32,
        gpus: Vec<u32>,
        log_file: PathBuf,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Running)?;
        self.pid = Some(pid);
        self.assigned_gpus = gpus;
        self.log_file = Some(log_file);
        self.started_at = Some(at);
        Ok(())
    }

    /// Record an observed process exit. A cancelling task always ends
    /// CANCELLED regardless of its exit code.
    pub fn mark_exited(&mut self, exit_code: i32, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let next = match self.status {
            TaskStatus::Cancelling => TaskStatus::Cancelled,
            _ if exit_code == 0 => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        };
        self.transition(next)?;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(at);
        if next == TaskStatus::Failed {
            self.error_message = Some(format!("process exited with code {exit_code}"));
        }
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed)?;
        self.error_message = Some(message.into());
        self.finished_at = Some(at);
        Ok(())
    }

    /// Apply a cancel request. Never fails: terminal and already-cancelling
    /// tasks are reported back unchanged.
    pub fn request_cancel(&mut self, at: DateTime<Utc>) -> CancelOutcome {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Cancelled;
                self.finished_at = Some(at);
                CancelOutcome::Cancelled
            }
            TaskStatus::Running => {
                self.status = TaskStatus::Cancelling;
                CancelOutcome::Cancelling
            }
            other => CancelOutcome::NotCancellable(other),
        }
    }
}

/// Count tasks per status. Every status is present, zero-filled.
pub fn count_by_status<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> BTreeMap<TaskStatus, usize> {
    let mut counts: BTreeMap<TaskStatus, usize> =
        TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
    for task in tasks {
        *counts.entry(task.status()).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task() -> Task {
        Task::new(
            Uuid::new_v4(),
            NewTask {
                command: "python train.py".into(),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn running_cannot_go_back_to_pending() {
        let mut task = pending_task();
        task.mark_running(42, vec![0], PathBuf::from("/tmp/t.log"), Utc::now())
            .unwrap();
        let err = task.transition(TaskStatus::Pending).unwrap_err();
        assert_eq!(err.from, TaskStatus::Running);
        assert_eq!(task.status(), TaskStatus::Running);
    }

    #[test]
    fn exit_code_decides_outcome() {
        let mut ok = pending_task();
        ok.mark_running(1, vec![0], PathBuf::from("a.log"), Utc::now()).unwrap();
        ok.mark_exited(0, Utc::now()).unwrap();
        assert_eq!(ok.status(), TaskStatus::Completed);
        assert_eq!(ok.exit_code, Some(0));

        let mut bad = pending_task();
        bad.mark_running(2, vec![1], PathBuf::from("b.log"), Utc::now()).unwrap();
        bad.mark_exited(3, Utc::now()).unwrap();
        assert_eq!(bad.status(), TaskStatus::Failed);
        assert_eq!(bad.exit_code, Some(3));
        assert!(bad.finished_at.is_some());
    }

    #[test]
    fn cancelling_task_ends_cancelled_even_on_success() {
        let mut task = pending_task();
        task.mark_running(1, vec![0], PathBuf::from("a.log"), Utc::now()).unwrap();
        assert_eq!(task.request_cancel(Utc::now()), CancelOutcome::Cancelling);
        task.mark_exited(0, Utc::now()).unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn cancel_is_idempotent_on_terminal_tasks() {
        let mut task = pending_task();
        assert_eq!(task.request_cancel(Utc::now()), CancelOutcome::Cancelled);
        let before = task.clone();
        assert_eq!(
            task.request_cancel(Utc::now()),
            CancelOutcome::NotCancellable(TaskStatus::Cancelled)
        );
        assert_eq!(task, before);
    }

    #[test]
    fn launch_failure_goes_straight_to_failed() {
        let mut task = pending_task();
        task.mark_failed("No such file or directory", Utc::now()).unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.assigned_gpus.is_empty());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("RUNNING".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert!("sleeping".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn requirement_validation() {
        let mut req = ResourceRequirement::default();
        assert!(req.validate().is_ok());
        req.gpu_count = 0;
        assert!(req.validate().is_err());
        req.gpu_count = 2;
        req.gpu_ids = vec![3];
        assert!(req.validate().is_err());
        req.gpu_ids = vec![3, 4];
        req.max_util_percent = 120.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn repeated_gpu_ids_are_rejected() {
        let req = ResourceRequirement {
            gpu_ids: vec![0, 0],
            gpu_count: 2,
            ..Default::default()
        };
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("gpu id 0 listed more than once"));

        let req = ResourceRequirement {
            gpu_ids: vec![0, 1],
            gpu_count: 2,
            ..Default::default()
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn counts_are_zero_filled() {
        let tasks = vec![pending_task(), pending_task()];
        let counts = count_by_status(&tasks);
        assert_eq!(counts.len(), TaskStatus::ALL.len());
        assert_eq!(counts[&TaskStatus::Pending], 2);
        assert_eq!(counts[&TaskStatus::Failed], 0);
    }

    #[test]
    fn legacy_records_fill_defaults() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"id":"{id}","command":"echo hi","status":"pending","created_at":"2025-01-01T00:00:00Z"}}"#
        );
        let task: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task.requirements.gpu_count, 1);
        assert_eq!(task.requirements.max_util_percent, 100.0);
        assert!(task.assigned_gpus.is_empty());
    }
}
