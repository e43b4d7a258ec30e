use grab_queue::QueueError;
use thiserror::Error;

/// Failures that stop a whole scheduling cycle. Per-task problems are
/// logged and never surface here.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task store unavailable: {0}")]
    Queue(#[from] QueueError),
}
