//! Accelerator telemetry and device matching.
//!
//! A [`ResourceMonitor`] produces one snapshot per call; [`match_devices`]
//! decides, without side effects, which devices of that snapshot satisfy
//! a task's requirement.

mod nvidia;
#[cfg(any(test, feature = "simulated-monitor"))]
mod fixed;

use std::collections::HashSet;

use grab_core::{ResourceRequirement, ResourceStatus};
use thiserror::Error;

pub use nvidia::NvidiaSmiMonitor;
#[cfg(any(test, feature = "simulated-monitor"))]
pub use fixed::StaticMonitor;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("telemetry unavailable: {0}")]
    Unavailable(String),

    #[error("telemetry call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed telemetry: {0}")]
    Parse(String),

    #[error("telemetry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of accelerator snapshots.
pub trait ResourceMonitor: Send + Sync {
    /// One entry per visible device, ordered by index.
    fn sample(&self) -> Result<Vec<ResourceStatus>, MonitorError>;
}

/// Pick `gpu_count` devices from `snapshot` for `req`, skipping `reserved`.
///
/// Candidates are ranked by free memory, most first, ties broken by lower
/// index. Returns `None` when too few devices qualify.
pub fn match_devices(
    req: &ResourceRequirement,
    snapshot: &[ResourceStatus],
    reserved: &HashSet<u32>,
) -> Option<Vec<u32>> {
    let wanted = req.gpu_count as usize;
    if wanted == 0 {
        return None;
    }

    let mut candidates: Vec<&ResourceStatus> = snapshot
        .iter()
        .filter(|gpu| req.gpu_ids.is_empty() || req.gpu_ids.contains(&gpu.index))
        .filter(|gpu| !reserved.contains(&gpu.index))
        .filter(|gpu| gpu.free_memory_gb() >= req.min_free_memory_gb)
        .filter(|gpu| gpu.utilization_percent <= req.max_util_percent)
        .collect();

    if candidates.len() < wanted {
        return None;
    }

    candidates.sort_by(|a, b| {
        b.free_memory_mb
            .cmp(&a.free_memory_mb)
            .then_with(|| a.index.cmp(&b.index))
    });
    Some(candidates.iter().take(wanted).map(|gpu| gpu.index).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn gpu(index: u32, free_gb: f64, util: f64) -> ResourceStatus {
        let free = (free_gb * 1024.0) as u64;
        ResourceStatus {
            index,
            name: format!("Test GPU {index}"),
            total_memory_mb: 24 * 1024,
            used_memory_mb: (24 * 1024u64).saturating_sub(free),
            free_memory_mb: free,
            utilization_percent: util,
            temperature: 40,
            sampled_at: Utc::now(),
        }
    }

    fn req(count: u32, min_gb: f64, max_util: f64) -> ResourceRequirement {
        ResourceRequirement {
            gpu_ids: Vec::new(),
            min_free_memory_gb: min_gb,
            max_util_percent: max_util,
            gpu_count: count,
        }
    }

    #[test]
    fn picks_the_device_meeting_thresholds() {
        let snapshot = vec![gpu(0, 10.0, 5.0), gpu(1, 2.0, 90.0)];
        let picked = match_devices(&req(1, 8.0, 50.0), &snapshot, &HashSet::new());
        assert_eq!(picked, Some(vec![0]));
    }

    #[test]
    fn ranks_by_free_memory_then_index() {
        let snapshot = vec![gpu(0, 4.0, 0.0), gpu(1, 12.0, 0.0), gpu(2, 12.0, 0.0), gpu(3, 8.0, 0.0)];
        let picked = match_devices(&req(3, 0.0, 100.0), &snapshot, &HashSet::new());
        assert_eq!(picked, Some(vec![1, 2, 3]));
    }

    #[test]
    fn respects_pinned_ids_and_reservations() {
        let snapshot = vec![gpu(0, 20.0, 0.0), gpu(1, 10.0, 0.0), gpu(2, 10.0, 0.0)];
        let mut pinned = req(1, 0.0, 100.0);
        pinned.gpu_ids = vec![1, 2];
        assert_eq!(match_devices(&pinned, &snapshot, &HashSet::new()), Some(vec![1]));

        let reserved: HashSet<u32> = [1].into_iter().collect();
        assert_eq!(match_devices(&pinned, &snapshot, &reserved), Some(vec![2]));

        let reserved: HashSet<u32> = [1, 2].into_iter().collect();
        assert_eq!(match_devices(&pinned, &snapshot, &reserved), None);
    }

    #[test]
    fn too_few_candidates_is_none() {
        let snapshot = vec![gpu(0, 10.0, 0.0), gpu(1, 1.0, 0.0)];
        assert_eq!(match_devices(&req(2, 4.0, 100.0), &snapshot, &HashSet::new()), None);
        assert_eq!(match_devices(&req(1, 0.0, 100.0), &[], &HashSet::new()), None);
    }

    #[test]
    fn utilization_bound_is_inclusive() {
        let snapshot = vec![gpu(0, 10.0, 50.0)];
        assert_eq!(match_devices(&req(1, 0.0, 50.0), &snapshot, &HashSet::new()), Some(vec![0]));
        assert_eq!(match_devices(&req(1, 0.0, 49.9), &snapshot, &HashSet::new()), None);
    }
}
