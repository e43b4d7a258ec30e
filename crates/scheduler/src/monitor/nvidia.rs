//! `nvidia-smi` backed monitor.

use std::io::ErrorKind;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use grab_core::ResourceStatus;
use tracing::{debug, warn};

use super::{MonitorError, ResourceMonitor};

const QUERY: &str =
    "--query-gpu=index,name,memory.total,memory.used,memory.free,utilization.gpu,temperature.gpu";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Samples devices by shelling out to `nvidia-smi` in CSV mode.
///
/// Each call is bounded by `timeout`; a hung driver call is killed and
/// reported as [`MonitorError::Timeout`].
#[derive(Debug, Clone)]
pub struct NvidiaSmiMonitor {
    program: String,
    timeout: Duration,
}

impl NvidiaSmiMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "nvidia-smi".to_string(),
            timeout,
        }
    }

    /// Use a different executable, e.g. a wrapper script.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn query(&self) -> Result<String, MonitorError> {
        let mut child = Command::new(&self.program)
            .arg(QUERY)
            .arg("--format=csv,noheader,nounits")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    MonitorError::Unavailable(format!("{} not found on PATH", self.program))
                }
                _ => MonitorError::Io(e),
            })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(program = %self.program, timeout = ?self.timeout, "telemetry call hung, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(MonitorError::Timeout(self.timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MonitorError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        String::from_utf8(output.stdout).map_err(|e| MonitorError::Parse(e.to_string()))
    }
}

impl ResourceMonitor for NvidiaSmiMonitor {
    fn sample(&self) -> Result<Vec<ResourceStatus>, MonitorError> {
        let stdout = self.query()?;
        let gpus = parse_csv(&stdout, Utc::now())?;
        debug!(gpus = gpus.len(), "sampled accelerators");
        Ok(gpus)
    }
}

/// Parse `nvidia-smi` CSV output (no header, no units) into statuses
/// ordered by index.
pub(crate) fn parse_csv(
    output: &str,
    sampled_at: DateTime<Utc>,
) -> Result<Vec<ResourceStatus>, MonitorError> {
    let mut gpus = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_row(line, sampled_at))
        .collect::<Result<Vec<_>, _>>()?;
    gpus.sort_by_key(|gpu| gpu.index);
    Ok(gpus)
}

fn parse_row(line: &str, sampled_at: DateTime<Utc>) -> Result<ResourceStatus, MonitorError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 7 {
        return Err(MonitorError::Parse(format!("expected 7 fields, got {}: {line:?}", fields.len())));
    }
    // Device names could in principle contain commas; the numeric tail is fixed.
    let tail = &fields[fields.len() - 5..];
    let name = fields[1..fields.len() - 5].join(",");

    Ok(ResourceStatus {
        index: number(fields[0], "index", line)?,
        name,
        total_memory_mb: number(tail[0], "memory.total", line)?,
        used_memory_mb: number(tail[1], "memory.used", line)?,
        free_memory_mb: number(tail[2], "memory.free", line)?,
        utilization_percent: optional_number(tail[3], "utilization.gpu", line)?,
        temperature: optional_number(tail[4], "temperature.gpu", line)?,
        sampled_at,
    })
}

fn number<T: std::str::FromStr>(raw: &str, field: &str, line: &str) -> Result<T, MonitorError> {
    raw.parse()
        .map_err(|_| MonitorError::Parse(format!("bad {field} value {raw:?} in {line:?}")))
}

/// Some boards report `[N/A]` or `[Not Supported]` for sensors; read those as zero.
fn optional_number<T: std::str::FromStr + Default>(
    raw: &str,
    field: &str,
    line: &str,
) -> Result<T, MonitorError> {
    if raw.starts_with('[') {
        return Ok(T::default());
    }
    number(raw, field, line)
}
