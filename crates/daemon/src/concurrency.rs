//! Concurrency planning module for transcoderd
//!
//! Derives the worker-pool size from CPU core count and configuration.

use transcoderd_config::JobsConfig;

/// Upper bound for a derived pool size. Each ffmpeg process is itself multi-threaded.
const MAX_DERIVED_JOBS: u32 = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrently running encodes
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Uses an explicit non-zero `max_concurrent_jobs` unchanged
    /// - Otherwise one job per 8 cores, at least 1 and at most 4
    pub fn derive(cfg: &JobsConfig) -> Self {
        let total_cores = cfg
            .logical_cores
            .filter(|cores| *cores > 0)
            .unwrap_or_else(|| num_cpus::get() as u32);

        let max_concurrent_jobs = if cfg.max_concurrent_jobs > 0 {
            cfg.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

fn derive_max_jobs(cores: u32) -> u32 {
    (cores / 8).clamp(1, MAX_DERIVED_JOBS)
}
