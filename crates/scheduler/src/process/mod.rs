//! Subprocess lifecycle for admitted tasks.
//!
//! Each task runs as `sh -c <command>` in its own process group, with
//! stdout and stderr appended to one log file. Termination is
//! non-blocking: [`ProcessManager::terminate`] sends SIGTERM and records a
//! deadline, and a later [`ProcessManager::poll`] past that deadline
//! escalates to SIGKILL. An exited process stays tracked, reporting the
//! same exit, until [`ProcessManager::release`] is called for it.

mod logs;

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use grab_core::{Task, TaskId};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use logs::{read_log, DEFAULT_LOG_TAIL};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("cannot open log file {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("working directory {0} does not exist")]
    WorkingDir(PathBuf),

    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedProcess {
    pub pid: u32,
    pub log_file: PathBuf,
}

/// Observed state of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit code, or the negated signal number for signal deaths.
    Exited(i32),
    /// An adopted process vanished; its exit status cannot be known.
    Lost,
}

enum Handle {
    Owned(Child),
    /// Left behind by a previous daemon; tracked by pid only.
    Adopted,
}

struct ManagedProcess {
    pid: u32,
    handle: Handle,
    kill_deadline: Option<Instant>,
    killed: bool,
    /// Set once the process has been observed gone.
    exit: Option<ProcessState>,
}

/// Owns every subprocess the scheduler launched or adopted.
pub struct ProcessManager {
    logs_dir: PathBuf,
    processes: HashMap<TaskId, ManagedProcess>,
}

impl ProcessManager {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            processes: HashMap::new(),
        }
    }

    pub fn log_path(&self, id: &TaskId) -> PathBuf {
        self.logs_dir.join(format!("task_{id}.log"))
    }

    /// Start `task` on `gpus`. Any failure is also appended to the task's log.
    pub fn launch(&mut self, task: &Task, gpus: &[u32]) -> Result<LaunchedProcess, LaunchError> {
        let log_file = self.log_path(&task.id);
        let log_err = |source| LaunchError::Log {
            path: log_file.clone(),
            source,
        };
        let mut log = logs::open_append(&log_file).map_err(log_err)?;
        logs::write_header(&mut log, task, gpus, Utc::now()).map_err(log_err)?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&task.command)
            .envs(&task.env)
            .env("CUDA_VISIBLE_DEVICES", logs::join_ids(gpus))
            .stdin(Stdio::null())
            .process_group(0);
        if let Some(dir) = &task.working_dir {
            if !dir.is_dir() {
                let err = LaunchError::WorkingDir(dir.clone());
                let _ = writeln!(log, "[gpu-grab] {err}");
                return Err(err);
            }
            command.current_dir(dir);
        }
        let stdout = log.try_clone().map_err(log_err)?;
        let stderr = log.try_clone().map_err(log_err)?;
        command.stdout(stdout).stderr(stderr);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = writeln!(log, "[gpu-grab] failed to start command: {e}");
                return Err(LaunchError::Spawn(e));
            }
        };

        let pid = child.id();
        info!(task_id = %task.id, pid, gpus = ?gpus, "task process started");
        self.processes.insert(
            task.id,
            ManagedProcess {
                pid,
                handle: Handle::Owned(child),
                kill_deadline: None,
                killed: false,
                exit: None,
            },
        );
        Ok(LaunchedProcess { pid, log_file })
    }

    /// Track a still-running process from a previous daemon instance.
    pub fn adopt(&mut self, id: TaskId, pid: u32) {
        debug!(task_id = %id, pid, "adopting orphaned task process");
        self.processes.insert(
            id,
            ManagedProcess {
                pid,
                handle: Handle::Adopted,
                kill_deadline: None,
                killed: false,
                exit: None,
            },
        );
    }

    pub fn is_tracked(&self, id: &TaskId) -> bool {
        self.processes.contains_key(id)
    }

    /// True once `terminate` has been called for `id`.
    pub fn is_terminating(&self, id: &TaskId) -> bool {
        self.processes
            .get(id)
            .is_some_and(|p| p.kill_deadline.is_some())
    }

    /// True when the process is gone but its handle has not been released.
    pub fn has_exited(&self, id: &TaskId) -> bool {
        self.processes.get(id).is_some_and(|p| p.exit.is_some())
    }

    pub fn tracked(&self) -> Vec<TaskId> {
        self.processes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Non-blocking status check. `None` when `id` is not tracked.
    ///
    /// A finished process keeps reporting its exit until released, so the
    /// outcome survives a failed attempt to record it.
    pub fn poll(&mut self, id: &TaskId) -> Option<ProcessState> {
        let managed = self.processes.get_mut(id)?;
        if let Some(exit) = managed.exit {
            return Some(exit);
        }
        let state = match &mut managed.handle {
            Handle::Owned(child) => match child.try_wait() {
                Ok(Some(status)) => ProcessState::Exited(exit_code(status)),
                Ok(None) => ProcessState::Running,
                Err(e) => {
                    warn!(task_id = %id, pid = managed.pid, error = %e, "cannot wait on task process");
                    ProcessState::Lost
                }
            },
            Handle::Adopted => {
                if is_alive(managed.pid) {
                    ProcessState::Running
                } else {
                    ProcessState::Lost
                }
            }
        };

        if state == ProcessState::Running {
            managed.escalate_if_overdue(id);
        } else {
            managed.exit = Some(state);
        }
        Some(state)
    }

    /// Forget a handle, normally once its exit has been recorded.
    pub fn release(&mut self, id: &TaskId) -> bool {
        self.processes.remove(id).is_some()
    }

    /// Ask the process group to stop, escalating to SIGKILL on a later
    /// `poll` once `grace` has passed. Repeated calls are no-ops.
    /// Returns false when `id` is not tracked.
    pub fn terminate(&mut self, id: &TaskId, grace: Duration) -> bool {
        let Some(managed) = self.processes.get_mut(id) else {
            return false;
        };
        if managed.kill_deadline.is_some() || managed.exit.is_some() {
            return true;
        }
        info!(task_id = %id, pid = managed.pid, grace = ?grace, "terminating task process");
        signal_tree(managed.pid, Signal::SIGTERM);
        managed.kill_deadline = Some(Instant::now() + grace);
        true
    }

    /// Terminate everything, wait up to `grace`, then kill what is left.
    pub fn shutdown(&mut self, grace: Duration) -> Vec<(TaskId, ProcessState)> {
        let ids = self.tracked();
        for id in &ids {
            self.terminate(id, grace);
        }

        let deadline = Instant::now() + grace;
        let mut finished = Vec::with_capacity(ids.len());
        while !self.processes.is_empty() && Instant::now() < deadline {
            for id in self.tracked() {
                match self.poll(&id) {
                    Some(ProcessState::Running) | None => {}
                    Some(state) => {
                        self.release(&id);
                        finished.push((id, state));
                    }
                }
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }

        for (id, mut managed) in self.processes.drain() {
            warn!(task_id = %id, pid = managed.pid, "task process outlived shutdown grace, killing");
            signal_tree(managed.pid, Signal::SIGKILL);
            let state = match &mut managed.handle {
                Handle::Owned(child) => match child.wait() {
                    Ok(status) => ProcessState::Exited(exit_code(status)),
                    Err(_) => ProcessState::Lost,
                },
                Handle::Adopted => ProcessState::Lost,
            };
            finished.push((id, state));
        }
        finished
    }
}

impl ManagedProcess {
    fn escalate_if_overdue(&mut self, id: &TaskId) {
        let overdue = self.kill_deadline.is_some_and(|d| Instant::now() >= d);
        if overdue && !self.killed {
            warn!(task_id = %id, pid = self.pid, "termination grace elapsed, sending SIGKILL");
            signal_tree(self.pid, Signal::SIGKILL);
            self.killed = true;
        }
    }
}

/// Whether `pid` names a live process (zombies of our own children count).
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

/// Signal the whole process group led by `pid`, falling back to the
/// single process when it does not lead a group.
fn signal_tree(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let pid = Pid::from_raw(raw);
    match killpg(pid, signal) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            if let Err(e) = kill(pid, signal) {
                if e != Errno::ESRCH {
                    warn!(pid = raw, signal = ?signal, error = %e, "failed to signal task process");
                }
            }
        }
        Err(e) => warn!(pid = raw, signal = ?signal, error = %e, "failed to signal task group"),
    }
}
