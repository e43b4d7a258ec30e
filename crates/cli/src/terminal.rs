use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use grab_core::protocol::StatusReply;
use grab_core::{Task, TaskStatus};

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const HEADER: Color = Color::Magenta;
    const DIM: Color = Color::DarkGrey;
    const ERROR: Color = Color::Red;
    const OK: Color = Color::Green;
}

fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Pending => Color::Yellow,
        TaskStatus::Running => Color::Cyan,
        TaskStatus::Cancelling => Color::DarkYellow,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Cancelled => Color::DarkGrey,
    }
}

const TABLE_RULE: usize = 84;

// ── Plain rendering ───────────────────────────────────────────

fn table_header() -> String {
    format!(
        "{:<10} {:<20} {:<11} {:>4} {:<10} {:<19}",
        "ID", "NAME", "STATUS", "PRIO", "GPUS", "CREATED"
    )
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('~');
    out
}

/// Columns before and after the status cell, so the status can be colored
/// without disturbing alignment.
fn task_row(task: &Task) -> (String, String, String) {
    let gpus = if task.assigned_gpus.is_empty() {
        "-".to_string()
    } else {
        task.assigned_gpus
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    };
    let before = format!(
        "{:<10} {:<20} ",
        task.short_id(),
        truncate(&task.display_name(), 20)
    );
    let status = format!("{:<11}", task.status().as_str());
    let after = format!(
        " {:>4} {:<10} {:<19}",
        task.priority,
        truncate(&gpus, 10),
        task.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    (before, status, after)
}

/// Task list as a plain-text table.
pub fn format_task_table(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks found.\n".to_string();
    }
    let mut out = table_header();
    out.push('\n');
    out.push_str(&"-".repeat(TABLE_RULE));
    out.push('\n');
    for task in tasks {
        let (before, status, after) = task_row(task);
        out.push_str(before.as_str());
        out.push_str(status.as_str());
        out.push_str(after.trim_end());
        out.push('\n');
    }
    out
}

pub fn format_status(status: &StatusReply) -> String {
    let mut out = String::from("=== GPU Status ===\n");
    if status.gpus.is_empty() {
        out.push_str("  (no GPU telemetry available)\n");
    }
    for gpu in &status.gpus {
        out.push_str(&format!("  GPU {}: {}\n", gpu.index, gpu.name));
        out.push_str(&format!(
            "    Memory: {:.1} GB free / {:.1} GB total\n",
            gpu.free_memory_gb(),
            gpu.total_memory_mb as f64 / 1024.0
        ));
        out.push_str(&format!("    Utilization: {}%\n", gpu.utilization_percent));
        out.push_str(&format!("    Temperature: {}C\n", gpu.temperature));
    }

    out.push_str("\n=== Tasks ===\n");
    for state in TaskStatus::ALL {
        let count = status.tasks.get(&state).copied().unwrap_or(0);
        out.push_str(&format!("  {:<11} {count}\n", format!("{state}:")));
    }

    out.push_str("\n=== Daemon ===\n");
    out.push_str(&format!(
        "  Scheduler:      {}\n",
        if status.running { "running" } else { "stopped" }
    ));
    out.push_str(&format!("  Uptime:         {:.0}s\n", status.uptime_seconds));
    out.push_str(&format!("  Check interval: {}s\n", status.config.check_interval));
    out.push_str(&format!("  Max concurrent: {}\n", status.config.max_concurrent_tasks));
    let m = &status.metrics;
    out.push_str(&format!(
        "  Cycles: {}  Admitted: {}  Launch failures: {}  Monitor errors: {}\n",
        m.cycles, m.admitted, m.launch_failures, m.monitor_errors
    ));
    out
}

// ── Terminal ─────────────────────────────────────────────────

/// Colored output on stdout/stderr. Falls back to plain text when stdout
/// is not a terminal.
pub struct Terminal {
    color: bool,
}

impl Terminal {
    pub fn new() -> Self {
        use std::io::IsTerminal;
        Self {
            color: io::stdout().is_terminal(),
        }
    }

    pub fn print_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut stdout = io::stdout();
        if !self.color || tasks.is_empty() {
            write!(stdout, "{}", format_task_table(tasks))?;
            return Ok(());
        }

        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print(table_header()),
            Print("\n"),
            SetForegroundColor(Colors::DIM),
            Print("-".repeat(TABLE_RULE)),
            Print("\n"),
            ResetColor,
        )?;
        for task in tasks {
            let (before, status, after) = task_row(task);
            execute!(
                stdout,
                Print(before),
                SetForegroundColor(status_color(task.status())),
                Print(status),
                ResetColor,
                Print(after.trim_end()),
                Print("\n"),
            )?;
        }
        stdout.flush()?;
        Ok(())
    }

    pub fn print_status(&self, status: &StatusReply) -> Result<()> {
        let mut stdout = io::stdout();
        write!(stdout, "{}", format_status(status))?;
        stdout.flush()?;
        Ok(())
    }

    /// Print a success line.
    pub fn print_ok(&self, message: &str) -> Result<()> {
        let mut stdout = io::stdout();
        if self.color {
            execute!(
                stdout,
                SetForegroundColor(Colors::OK),
                Print(message),
                ResetColor,
                Print("\n"),
            )?;
        } else {
            writeln!(stdout, "{message}")?;
        }
        Ok(())
    }

    /// Print raw text, e.g. log output, unchanged.
    pub fn print_raw(&self, text: &str) -> Result<()> {
        let mut stdout = io::stdout();
        write!(stdout, "{text}")?;
        stdout.flush()?;
        Ok(())
    }

    /// Print an error message to stderr.
    pub fn print_error(&self, message: &str) {
        let mut stderr = io::stderr();
        let _ = execute!(
            stderr,
            SetForegroundColor(Colors::ERROR),
            Print("Error: "),
            ResetColor,
            Print(message),
            Print("\n"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use grab_core::protocol::StatusConfig;
    use grab_core::{NewTask, ResourceStatus, SchedulerMetrics};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn task(name: &str) -> Task {
        let spec = NewTask {
            name: name.to_string(),
            command: "python train.py".into(),
            priority: 5,
            ..NewTask::default()
        };
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        Task::new("8c5b1f0e-2d4a-4a7e-9c51-0b6f3e2a9d10".parse().unwrap(), spec, created)
    }

    #[test]
    fn test_task_table() {
        let mut running = task("a-very-long-training-run-name");
        running
            .mark_running(4242, vec![0, 2], PathBuf::from("/tmp/x.log"), Utc::now())
            .unwrap();
        let table = format_task_table(&[task(""), running]);
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[0].starts_with("ID"));
        assert!(lines[2].starts_with("8c5b1f0e   8c5b1f0e"));
        assert!(lines[2].contains("pending"));
        assert!(lines[2].contains("2026-03-01 12:30:00"));
        assert!(lines[3].contains("a-very-long-trainin~"));
        assert!(lines[3].contains("running"));
        assert!(lines[3].contains("0,2"));
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(format_task_table(&[]), "No tasks found.\n");
    }

    #[test]
    fn test_status_summary() {
        let reply = StatusReply {
            gpus: vec![ResourceStatus {
                index: 0,
                name: "NVIDIA A100".into(),
                total_memory_mb: 40960,
                used_memory_mb: 1024,
                free_memory_mb: 39936,
                utilization_percent: 3.0,
                temperature: 41,
                sampled_at: Utc::now(),
            }],
            tasks: BTreeMap::from([(TaskStatus::Running, 2), (TaskStatus::Pending, 1)]),
            running: true,
            uptime_seconds: 61.4,
            config: StatusConfig {
                check_interval: 10.0,
                max_concurrent_tasks: 4,
            },
            metrics: SchedulerMetrics::default(),
        };
        let text = format_status(&reply);
        assert!(text.contains("GPU 0: NVIDIA A100"));
        assert!(text.contains("39.0 GB free / 40.0 GB total"));
        assert!(text.contains("running:    2"));
        assert!(text.contains("completed:  0"));
        assert!(text.contains("Uptime:         61s"));
    }
}
