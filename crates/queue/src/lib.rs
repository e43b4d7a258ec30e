//! Durable, process-safe task queue backed by a single JSON file.

pub mod error;
pub mod lock;
pub mod store;

pub use error::QueueError;
pub use lock::{RetryPolicy, StoreLock};
pub use store::TaskStore;
