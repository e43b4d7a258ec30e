//! In-memory monitor for tests and dry runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use grab_core::ResourceStatus;

use super::{MonitorError, ResourceMonitor};

const FAKE_MEMORY_MB: u64 = 24 * 1024;

/// Returns a settable snapshot, or a settable failure.
#[derive(Debug, Default)]
pub struct StaticMonitor {
    snapshot: Mutex<Vec<ResourceStatus>>,
    failure: Mutex<Option<String>>,
    samples: AtomicUsize,
}

impl StaticMonitor {
    pub fn new(snapshot: Vec<ResourceStatus>) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            ..Default::default()
        }
    }

    /// `count` idle devices with 24 GiB free each.
    pub fn idle(count: u32) -> Self {
        Self::new((0..count).map(|i| Self::device(i, FAKE_MEMORY_MB, 0.0)).collect())
    }

    pub fn device(index: u32, free_memory_mb: u64, utilization_percent: f64) -> ResourceStatus {
        let total = free_memory_mb.max(FAKE_MEMORY_MB);
        ResourceStatus {
            index,
            name: format!("Simulated GPU {index}"),
            total_memory_mb: total,
            used_memory_mb: total - free_memory_mb,
            free_memory_mb,
            utilization_percent,
            temperature: 35,
            sampled_at: Utc::now(),
        }
    }

    pub fn set_snapshot(&self, snapshot: Vec<ResourceStatus>) {
        if let Ok(mut guard) = self.snapshot.lock() {
            *guard = snapshot;
        }
    }

    /// Make every following sample fail with `message` until cleared.
    pub fn set_failure(&self, message: Option<&str>) {
        if let Ok(mut guard) = self.failure.lock() {
            *guard = message.map(str::to_string);
        }
    }

    /// Number of `sample` calls so far.
    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::Relaxed)
    }
}

impl ResourceMonitor for StaticMonitor {
    fn sample(&self) -> Result<Vec<ResourceStatus>, MonitorError> {
        self.samples.fetch_add(1, Ordering::Relaxed);
        let failure = self
            .failure
            .lock()
            .map_err(|e| MonitorError::Unavailable(e.to_string()))?
            .clone();
        if let Some(message) = failure {
            return Err(MonitorError::Unavailable(message));
        }
        let now = Utc::now();
        let snapshot = self
            .snapshot
            .lock()
            .map_err(|e| MonitorError::Unavailable(e.to_string()))?;
        Ok(snapshot
            .iter()
            .cloned()
            .map(|mut gpu| {
                gpu.sampled_at = now;
                gpu
            })
            .collect())
    }
}
