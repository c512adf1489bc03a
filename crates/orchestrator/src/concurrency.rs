//! Concurrency planning
//!
//! Derives the task concurrency bound and per-task encoder threads from the
//! CPU core count and configuration.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of tasks processing at once
    pub max_concurrent_tasks: u32,
    /// Encoder threads handed to each transcoder process
    pub threads_per_task: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - Detects CPU cores via num_cpus
    /// - Uses an explicit non-zero `max_concurrent_tasks`, otherwise 3 on 16+ cores and 2 below
    /// - Splits the cores evenly across tasks, at least one thread each
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_for_cores(cfg, num_cpus::get() as u32)
    }

    fn derive_for_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);

        let max_concurrent_tasks = if cfg.scheduler.max_concurrent_tasks > 0 {
            cfg.scheduler.max_concurrent_tasks
        } else {
            derive_max_tasks(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_tasks,
            threads_per_task: (total_cores / max_concurrent_tasks).max(1),
        }
    }
}

/// Derive max concurrent tasks based on core count
fn derive_max_tasks(cores: u32) -> u32 {
    if cores >= 16 {
        3
    } else {
        2
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
