//! GPU-aware task scheduler.
//!
//! A single-threaded cycle reaps finished processes, then admits PENDING
//! tasks in priority order onto devices that meet their requirements. All
//! state lives in the [`TaskStore`](grab_queue::TaskStore); the scheduler only
//! owns the subprocess handles.

pub mod runner;
pub mod types;

pub use runner::Scheduler;
pub use types::{AdmissionSkip, CycleReport, RecoveryReport, SchedulerConfig, CLEANUP_INTERVAL};
