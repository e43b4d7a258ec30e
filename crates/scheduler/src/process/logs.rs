//! Per-task log files.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use grab_core::Task;

/// Lines returned by [`read_log`] when the caller does not ask for a count.
pub const DEFAULT_LOG_TAIL: usize = 100;

pub(crate) fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

pub(crate) fn write_header(
    log: &mut File,
    task: &Task,
    gpus: &[u32],
    started: DateTime<Utc>,
) -> io::Result<()> {
    let workdir = match &task.working_dir {
        Some(dir) => dir.display().to_string(),
        None => std::env::current_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|_| "(inherited)".to_string()),
    };
    writeln!(log, "=== Task: {} ({}) ===", task.display_name(), task.id)?;
    writeln!(log, "Command: {}", task.command)?;
    writeln!(log, "Working dir: {workdir}")?;
    writeln!(log, "GPUs: {}", join_ids(gpus))?;
    writeln!(log, "Started: {}", started.to_rfc3339())?;
    writeln!(log, "{}\n", "=".repeat(50))?;
    log.flush()
}

pub(crate) fn join_ids(ids: &[u32]) -> String {
    ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

/// Last `tail` lines of a log file; `None` means [`DEFAULT_LOG_TAIL`] and
/// `Some(0)` the whole file.
pub fn read_log(path: &Path, tail: Option<usize>) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    let tail = tail.unwrap_or(DEFAULT_LOG_TAIL);
    if tail == 0 {
        return Ok(content.into_owned());
    }
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let start = lines.len().saturating_sub(tail);
    Ok(lines[start..].concat())
}
