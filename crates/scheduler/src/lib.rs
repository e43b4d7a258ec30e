pub mod error;
pub mod monitor;
pub mod process;
pub mod scheduler;

pub use error::SchedulerError;
#[cfg(any(test, feature = "simulated-monitor"))]
pub use monitor::StaticMonitor;
pub use monitor::{match_devices, MonitorError, NvidiaSmiMonitor, ResourceMonitor};
pub use process::{read_log, LaunchError, LaunchedProcess, ProcessManager, ProcessState, DEFAULT_LOG_TAIL};
pub use scheduler::{
    AdmissionSkip, CycleReport, RecoveryReport, Scheduler, SchedulerConfig, CLEANUP_INTERVAL,
};
