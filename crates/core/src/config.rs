use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::ResourceRequirement;

/// Prefix for environment overrides, e.g. `GPU_GRAB_MAX_CONCURRENT_TASKS`.
pub const ENV_PREFIX: &str = "GPU_GRAB_";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

// ── Top-level config ──────────────────────────────────────────

/// Daemon and client configuration, read from `~/.gpu-grab/config.yaml`.
///
/// Directory fields left unset resolve relative to `base_dir`. The scheduler
/// receives this value once at construction and never re-reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrabConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Seconds between scheduling cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_gpu_count")]
    pub default_gpu_count: u32,
    #[serde(default)]
    pub default_min_memory_gb: f64,
    #[serde(default = "default_max_util")]
    pub default_max_util_percent: f64,

    /// Grace period between SIGTERM and SIGKILL when stopping a task.
    #[serde(default = "default_grace")]
    pub termination_grace_secs: u64,
    /// Upper bound on a single telemetry call.
    #[serde(default = "default_monitor_timeout")]
    pub monitor_timeout_secs: u64,
    /// Finished tasks older than this are dropped from the store. 0 disables.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Terminate running tasks when the daemon stops.
    #[serde(default = "default_kill_on_shutdown")]
    pub kill_on_shutdown: bool,
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gpu-grab")
}

fn default_check_interval() -> f64 { 10.0 }
fn default_max_concurrent() -> usize { 4 }
fn default_log_level() -> String { "info".to_string() }
fn default_gpu_count() -> u32 { 1 }
fn default_max_util() -> f64 { 100.0 }
fn default_grace() -> u64 { 10 }
fn default_monitor_timeout() -> u64 { 5 }
fn default_retention_days() -> u32 { 7 }
fn default_kill_on_shutdown() -> bool { true }

impl Default for GrabConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            data_dir: None,
            logs_dir: None,
            socket_path: None,
            check_interval: default_check_interval(),
            max_concurrent_tasks: default_max_concurrent(),
            log_level: default_log_level(),
            default_gpu_count: default_gpu_count(),
            default_min_memory_gb: 0.0,
            default_max_util_percent: default_max_util(),
            termination_grace_secs: default_grace(),
            monitor_timeout_secs: default_monitor_timeout(),
            retention_days: default_retention_days(),
            kill_on_shutdown: default_kill_on_shutdown(),
        }
    }
}

impl GrabConfig {
    /// Return the default config file path: ~/.gpu-grab/config.yaml
    pub fn default_config_path() -> PathBuf {
        default_base_dir().join("config.yaml")
    }

    /// Load config from the given path, or the default path, then apply
    /// `GPU_GRAB_*` environment overrides and validate.
    /// Returns defaults if the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        let mut config = if config_path.exists() {
            tracing::debug!(path = %config_path.display(), "loading config");
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_yaml(&content)?
        } else {
            tracing::debug!(path = %config_path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_overrides(env_opt);
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML. An empty document yields the defaults.
    pub fn from_yaml(content: &str) -> Result<Self, CoreError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Write the config as YAML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, CoreError> {
        Ok(serde_yaml::to_string(self)?)
    }

    // ── Environment variable overrides ──────────────────────────

    /// Apply overrides from `lookup`, keyed by `GPU_GRAB_<FIELD>`.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |field: &str| lookup(&format!("{ENV_PREFIX}{field}"));

        if let Some(v) = get("BASE_DIR") {
            self.base_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOGS_DIR") {
            self.logs_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SOCKET_PATH") {
            self.socket_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        parse_into(get("CHECK_INTERVAL"), "CHECK_INTERVAL", &mut self.check_interval);
        parse_into(get("MAX_CONCURRENT_TASKS"), "MAX_CONCURRENT_TASKS", &mut self.max_concurrent_tasks);
        parse_into(get("DEFAULT_GPU_COUNT"), "DEFAULT_GPU_COUNT", &mut self.default_gpu_count);
        parse_into(get("DEFAULT_MIN_MEMORY_GB"), "DEFAULT_MIN_MEMORY_GB", &mut self.default_min_memory_gb);
        parse_into(get("DEFAULT_MAX_UTIL_PERCENT"), "DEFAULT_MAX_UTIL_PERCENT", &mut self.default_max_util_percent);
        parse_into(get("TERMINATION_GRACE_SECS"), "TERMINATION_GRACE_SECS", &mut self.termination_grace_secs);
        parse_into(get("MONITOR_TIMEOUT_SECS"), "MONITOR_TIMEOUT_SECS", &mut self.monitor_timeout_secs);
        parse_into(get("RETENTION_DAYS"), "RETENTION_DAYS", &mut self.retention_days);
        parse_into(get("KILL_ON_SHUTDOWN"), "KILL_ON_SHUTDOWN", &mut self.kill_on_shutdown);
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_tasks == 0 {
            return Err(CoreError::InvalidConfig(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if !self.check_interval.is_finite() || self.check_interval <= 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "check_interval must be positive, got {}",
                self.check_interval
            )));
        }
        if self.default_gpu_count == 0 {
            return Err(CoreError::InvalidConfig(
                "default_gpu_count must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.default_max_util_percent) {
            return Err(CoreError::InvalidConfig(format!(
                "default_max_util_percent must be within 0-100, got {}",
                self.default_max_util_percent
            )));
        }
        if self.default_min_memory_gb < 0.0 {
            return Err(CoreError::InvalidConfig(
                "default_min_memory_gb must not be negative".into(),
            ));
        }
        Ok(())
    }

    // ── Resolved paths ──────────────────────────────────────────

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("data"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("logs"))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("gpu-grab.sock"))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_timeout_secs)
    }

    /// Build a requirement, filling anything the submitter left out with
    /// the configured defaults.
    pub fn requirement_with_defaults(
        &self,
        gpu_ids: Vec<u32>,
        min_free_memory_gb: Option<f64>,
        max_util_percent: Option<f64>,
        gpu_count: Option<u32>,
    ) -> ResourceRequirement {
        ResourceRequirement {
            gpu_ids,
            min_free_memory_gb: min_free_memory_gb.unwrap_or(self.default_min_memory_gb),
            max_util_percent: max_util_percent.unwrap_or(self.default_max_util_percent),
            gpu_count: gpu_count.unwrap_or(self.default_gpu_count),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  data_dir:        {}", self.data_dir().display());
        tracing::info!("  logs_dir:        {}", self.logs_dir().display());
        tracing::info!("  socket:          {}", self.socket_path().display());
        tracing::info!("  check_interval:  {}s", self.check_interval);
        tracing::info!("  max_concurrent:  {}", self.max_concurrent_tasks);
        tracing::info!("  retention_days:  {}", self.retention_days);
    }
}

fn parse_into<T: FromStr>(value: Option<String>, key: &str, target: &mut T) {
    let Some(raw) = value else {
        return;
    };
    match raw.trim().parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => tracing::warn!(key = %format!("{ENV_PREFIX}{key}"), value = %raw, "ignoring unparsable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = GrabConfig::default();
        assert_eq!(config.check_interval, 10.0);
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.default_gpu_count, 1);
        assert!(config.kill_on_shutdown);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths_resolve_under_base_dir() {
        let config = GrabConfig {
            base_dir: PathBuf::from("/srv/grab"),
            ..Default::default()
        };
        assert_eq!(config.data_dir(), PathBuf::from("/srv/grab/data"));
        assert_eq!(config.logs_dir(), PathBuf::from("/srv/grab/logs"));
        assert_eq!(config.socket_path(), PathBuf::from("/srv/grab/gpu-grab.sock"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = GrabConfig::from_yaml("max_concurrent_tasks: 2\ncheck_interval: 0.5\n").unwrap();
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.check_interval, 0.5);
        assert_eq!(config.termination_grace_secs, 10);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = GrabConfig::from_yaml("  \n").unwrap();
        assert_eq!(config, GrabConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<String, String> = [
            ("GPU_GRAB_MAX_CONCURRENT_TASKS", "8"),
            ("GPU_GRAB_SOCKET_PATH", "/run/grab.sock"),
            ("GPU_GRAB_KILL_ON_SHUTDOWN", "false"),
            ("GPU_GRAB_CHECK_INTERVAL", "not-a-number"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = GrabConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());

        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.socket_path(), PathBuf::from("/run/grab.sock"));
        assert!(!config.kill_on_shutdown);
        assert_eq!(config.check_interval, 10.0);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let config = GrabConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let config = GrabConfig {
            base_dir: dir.path().to_path_buf(),
            max_concurrent_tasks: 3,
            default_min_memory_gb: 12.5,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let loaded = GrabConfig::from_yaml(&content).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_requirement_defaults() {
        let config = GrabConfig {
            default_gpu_count: 2,
            default_min_memory_gb: 8.0,
            ..Default::default()
        };
        let req = config.requirement_with_defaults(vec![], None, Some(50.0), None);
        assert_eq!(req.gpu_count, 2);
        assert_eq!(req.min_free_memory_gb, 8.0);
        assert_eq!(req.max_util_percent, 50.0);
    }
}
