//! Scheduler statistics and memory sampling.

use serde::{Deserialize, Serialize};

/// Rolling statistics over every task the scheduler has accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    /// Attempts that failed and were re-queued.
    pub retried_attempts: u64,
    /// Running mean over completed tasks.
    pub average_processing_time_secs: f64,
    /// Running mean over completed tasks.
    pub average_compression_ratio: f64,
}

impl SchedulerStats {
    /// Fold a completed task into the counters and running means.
    pub fn record_completion(&mut self, processing_time_secs: f64, compression_ratio: f64) {
        self.completed_tasks += 1;
        let n = self.completed_tasks as f64;
        self.average_processing_time_secs +=
            (processing_time_secs - self.average_processing_time_secs) / n;
        self.average_compression_ratio +=
            (compression_ratio - self.average_compression_ratio) / n;
    }
}

/// Percentage of physical memory in use.
pub fn memory_usage_percent() -> f32 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    mem_percent(&sys)
}

fn mem_percent(sys: &sysinfo::System) -> f32 {
    let total_memory = sys.total_memory();
    if total_memory == 0 {
        return 0.0;
    }
    (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_running_means() {
        let mut stats = SchedulerStats::default();
        stats.record_completion(10.0, 0.5);
        stats.record_completion(20.0, 0.7);
        stats.record_completion(30.0, 0.0);

        assert_eq!(stats.completed_tasks, 3);
        assert!((stats.average_processing_time_secs - 20.0).abs() < 1e-9);
        assert!((stats.average_compression_ratio - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_memory_usage_in_range() {
        let used = memory_usage_percent();
        assert!((0.0..=100.0).contains(&used));
    }

    // Property: the running mean equals the arithmetic mean of the samples.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_running_mean_matches_arithmetic_mean(
            samples in proptest::collection::vec((0.0f64..10_000.0, -1.0f64..1.0), 1..50),
        ) {
            let mut stats = SchedulerStats::default();
            for (time, ratio) in &samples {
                stats.record_completion(*time, *ratio);
            }
            let n = samples.len() as f64;
            let mean_time: f64 = samples.iter().map(|(t, _)| t).sum::<f64>() / n;
            let mean_ratio: f64 = samples.iter().map(|(_, r)| r).sum::<f64>() / n;

            prop_assert!((stats.average_processing_time_secs - mean_time).abs() < 1e-6);
            prop_assert!((stats.average_compression_ratio - mean_ratio).abs() < 1e-9);
        }
    }
}
