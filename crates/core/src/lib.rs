pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod protocol;

pub use config::GrabConfig;
pub use error::*;
pub use metrics::SchedulerMetrics;
pub use model::*;
