use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use grab_core::TaskStatus;

/// Queue commands until the GPUs they need are free.
///
/// Talks to a running `gpu-grabd` over its Unix socket.
#[derive(Parser, Debug)]
#[command(name = "gpu-grab", version, about = "GPU training task scheduler")]
pub struct CliArgs {
    /// Path to config file (default: ~/.gpu-grab/config.yaml)
    #[arg(long, global = true, env = "GPU_GRAB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Daemon socket (overrides the configured socket_path)
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a new task
    Submit(SubmitArgs),
    /// Show GPU, task and daemon status
    Status,
    /// List tasks
    List {
        /// Filter by status, or "all"
        #[arg(short, long, default_value = "all", value_parser = parse_status_filter)]
        status: StatusFilter,
    },
    /// Cancel a pending or running task
    Cancel {
        /// Task id or a unique prefix of it
        task_id: String,
    },
    /// Print a task's log output
    Logs {
        /// Task id or a unique prefix of it
        task_id: String,
        /// Number of trailing lines to show; 0 shows the whole file
        #[arg(short, long, default_value_t = 100)]
        tail: usize,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Shell command to run
    pub command: String,

    /// Task name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Working directory (default: current directory)
    #[arg(short, long = "workdir")]
    pub workdir: Option<PathBuf>,

    /// Specific GPU ids to choose from, e.g. 0,1
    #[arg(short, long = "gpus", value_delimiter = ',')]
    pub gpus: Vec<u32>,

    /// Number of GPUs required
    #[arg(short = 'c', long)]
    pub gpu_count: Option<u32>,

    /// Minimum free memory per GPU in GB
    #[arg(short, long = "memory")]
    pub memory: Option<f64>,

    /// Required idle margin in percent; max utilization is 100 minus this
    #[arg(short, long, value_parser = parse_percent)]
    pub util_margin: Option<f64>,

    /// Task priority, higher runs first
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i64,

    /// Environment variable for the task, KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,
}

impl SubmitArgs {
    pub fn max_util_percent(&self) -> Option<f64> {
        self.util_margin.map(|margin| 100.0 - margin)
    }

    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.env.iter().cloned().collect()
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

/// `list --status` value; `All` sends no filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Only(TaskStatus),
}

impl StatusFilter {
    pub fn as_option(self) -> Option<TaskStatus> {
        match self {
            StatusFilter::All => None,
            StatusFilter::Only(status) => Some(status),
        }
    }
}

fn parse_status_filter(s: &str) -> Result<StatusFilter, String> {
    if s.eq_ignore_ascii_case("all") {
        return Ok(StatusFilter::All);
    }
    s.parse().map(StatusFilter::Only).map_err(|e: grab_core::CoreError| e.to_string())
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_percent(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("not a number: '{s}'"))?;
    if (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("must be within 0-100, got {value}"))
    }
}
