use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use grab_core::{Task, TaskId, TaskStatus};
use grab_queue::QueueError;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::monitor::match_devices;
use crate::process::ProcessState;
use crate::scheduler::types::{AdmissionSkip, CycleReport, CLEANUP_INTERVAL};

use super::Scheduler;

/// Longest uninterrupted sleep while waiting for the next cycle, so a
/// shutdown request is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

impl Scheduler {
    /// Run the scheduling loop. Blocks until shutdown is signaled.
    pub fn run(&mut self) {
        info!(
            interval = ?self.config.check_interval,
            max_concurrent = self.config.max_concurrent_tasks,
            "scheduler started"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.tick() {
                Ok(report) if !report.is_idle() => debug!(
                    admitted = report.admitted.len(),
                    finished = report.finished.len(),
                    launch_failures = report.launch_failures.len(),
                    "cycle complete"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "scheduling cycle failed"),
            }
            self.sleep_until_next_cycle();
        }

        self.stop();
        info!("scheduler stopped");
    }

    /// One full cycle: signal, reap, admit, then the retention sweep.
    ///
    /// Only a failure to read the store aborts the cycle; anything tied to
    /// a single task is logged and skipped.
    pub fn tick(&mut self) -> Result<CycleReport, SchedulerError> {
        let mut report = CycleReport::default();
        let active = self.store.active()?;

        self.signal_cancelling(&active, &mut report);
        self.reap(&active, &mut report);
        self.admit(&mut report)?;
        self.sweep_expired(&mut report);

        let tracked = self.processes.len();
        self.with_metrics(|m| {
            m.cycles += 1;
            m.active_tasks = tracked;
            m.last_cycle_at = Some(Utc::now());
        });
        Ok(report)
    }

    fn sleep_until_next_cycle(&self) {
        let wake = Instant::now() + self.config.check_interval;
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= wake {
                break;
            }
            std::thread::sleep((wake - now).min(SLEEP_SLICE));
        }
    }

    // ── Signal ───────────────────────────────────────────────────

    fn signal_cancelling(&mut self, active: &[Task], report: &mut CycleReport) {
        for task in active.iter().filter(|t| t.status() == TaskStatus::Cancelling) {
            if !self.ensure_tracked(task)
                || self.processes.is_terminating(&task.id)
                || self.processes.has_exited(&task.id)
            {
                continue;
            }
            self.processes
                .terminate(&task.id, self.config.termination_grace);
            report.signalled.push(task.id);
        }
    }

    // ── Reap ─────────────────────────────────────────────────────

    fn reap(&mut self, active: &[Task], report: &mut CycleReport) {
        for task in active {
            if !self.ensure_tracked(task) {
                self.finish_lost(task, report);
                continue;
            }
            match self.processes.poll(&task.id) {
                Some(ProcessState::Running) | None => {}
                Some(ProcessState::Exited(code)) => {
                    let now = Utc::now();
                    let result = self.store.update(&task.id, |t| {
                        t.mark_exited(code, now)?;
                        Ok(t.status())
                    });
                    // Unrecorded exits keep their handle and are retried next cycle.
                    if self.record_outcome(task, result, report) {
                        self.processes.release(&task.id);
                    }
                }
                Some(ProcessState::Lost) => self.finish_lost(task, report),
            }
        }

        // Handles no longer backed by an active task, e.g. a process
        // stopped because its admission could not be recorded.
        let active_ids: HashSet<TaskId> = active.iter().map(|t| t.id).collect();
        for id in self.processes.tracked() {
            if !active_ids.contains(&id) {
                if let Some(state) = self.processes.poll(&id) {
                    if state != ProcessState::Running {
                        self.processes.release(&id);
                        debug!(task_id = %id, ?state, "released stray process handle");
                    }
                }
            }
        }
    }

    /// The process vanished without an observable exit status.
    fn finish_lost(&mut self, task: &Task, report: &mut CycleReport) {
        let now = Utc::now();
        let message = match task.pid {
            Some(pid) => format!("process {pid} disappeared; exit status unknown"),
            None => "no process recorded for running task".to_string(),
        };
        let result = self.store.update(&task.id, |t| {
            if t.status() == TaskStatus::Cancelling {
                t.transition(TaskStatus::Cancelled)?;
                t.finished_at = Some(now);
            } else {
                t.mark_failed(message.clone(), now)?;
            }
            Ok(t.status())
        });
        if self.record_outcome(task, result, report) {
            self.processes.release(&task.id);
        }
    }

    /// Log and count a finished task. False when the store write failed.
    fn record_outcome(
        &self,
        task: &Task,
        result: Result<TaskStatus, QueueError>,
        report: &mut CycleReport,
    ) -> bool {
        match result {
            Ok(status) => {
                info!(task_id = %task.id, name = %task.display_name(), %status, "task finished");
                self.record_finished(status);
                report.finished.push((task.id, status));
                true
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "could not record task outcome, retrying next cycle");
                false
            }
        }
    }

    // ── Admit ────────────────────────────────────────────────────

    fn admit(&mut self, report: &mut CycleReport) -> Result<(), SchedulerError> {
        let limit = self.config.max_concurrent_tasks;
        let mut running = self.store.list(Some(TaskStatus::Running))?.len();
        if running >= limit {
            debug!(running, limit, "at capacity, skipping admission");
            report.skipped = Some(AdmissionSkip::AtCapacity);
            return Ok(());
        }

        let pending = self.store.pending_by_priority()?;
        if pending.is_empty() {
            return Ok(());
        }

        let snapshot = match self.monitor.sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "gpu sample failed, skipping admission this cycle");
                self.with_metrics(|m| m.monitor_errors += 1);
                report.skipped = Some(AdmissionSkip::MonitorUnavailable(e.to_string()));
                return Ok(());
            }
        };

        let mut reserved: HashSet<u32> = HashSet::new();
        for task in &pending {
            if running >= limit {
                break;
            }
            let Some(gpus) = match_devices(&task.requirements, &snapshot, &reserved) else {
                debug!(task_id = %task.id, "no matching gpus yet");
                continue;
            };
            if self.start(task, &gpus, report) {
                reserved.extend(gpus.iter().copied());
                running += 1;
            }
        }
        Ok(())
    }

    /// Launch one task and record it RUNNING. Returns true when admitted.
    fn start(&mut self, task: &Task, gpus: &[u32], report: &mut CycleReport) -> bool {
        let now = Utc::now();
        let launched = match self.processes.launch(task, gpus) {
            Ok(launched) => launched,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "task launch failed");
                let message = format!("launch failed: {e}");
                let result = self.store.update(&task.id, |t| {
                    t.mark_failed(message.clone(), now)?;
                    Ok(())
                });
                match result {
                    Ok(()) => self.with_metrics(|m| {
                        m.launch_failures += 1;
                        m.failed += 1;
                    }),
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "could not record launch failure")
                    }
                }
                report.launch_failures.push(task.id);
                return false;
            }
        };

        let result = self.store.update(&task.id, |t| {
            t.mark_running(launched.pid, gpus.to_vec(), launched.log_file.clone(), now)?;
            Ok(())
        });
        match result {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    name = %task.display_name(),
                    pid = launched.pid,
                    gpus = ?gpus,
                    "task admitted"
                );
                self.with_metrics(|m| m.admitted += 1);
                report.admitted.push((task.id, gpus.to_vec()));
                true
            }
            Err(e) => {
                // Most likely cancelled while we were launching.
                warn!(task_id = %task.id, error = %e, "task changed during launch, stopping its process");
                self.processes.terminate(&task.id, Duration::ZERO);
                false
            }
        }
    }

    // ── Retention ────────────────────────────────────────────────

    fn sweep_expired(&mut self, report: &mut CycleReport) {
        let Some(retention) = self.config.retention else {
            return;
        };
        if self
            .last_cleanup
            .is_some_and(|at| at.elapsed() < CLEANUP_INTERVAL)
        {
            return;
        }
        self.last_cleanup = Some(Instant::now());
        match self.store.cleanup(retention) {
            Ok(removed) => report.cleaned = removed,
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
    }
}
