//! Metrics module for transcoderd
//!
//! Provides the metrics snapshot shared between the orchestrator, the daemon's
//! refresh loop and the read-only metrics endpoint.

use crate::jobs::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Progress of one running encode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub source_path: String,
    pub progress: f64,
    pub started_at: Option<i64>,
}

impl From<&Job> for JobMetrics {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            source_path: job.source_path.display().to_string(),
            progress: job.progress,
            started_at: job.started_at,
        }
    }
}

/// Number of jobs in each status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl StatusCounts {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
            counts.total += 1;
        }
        counts
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    /// Jobs currently encoding
    pub jobs: Vec<JobMetrics>,
    pub counts: StatusCounts,
    pub system: SystemMetrics,
    /// Dispatched jobs waiting for a worker slot
    pub queue_len: usize,
    /// Jobs holding a worker slot
    pub running_jobs: usize,
    pub max_concurrent_jobs: usize,
    /// Folder under watch, if any
    pub watch_folder: Option<String>,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with(status: JobStatus) -> Job {
        Job {
            id: format!("job-{}", status),
            status,
            ..Job::new("/videos/a.mov")
        }
    }

    #[test]
    fn test_status_counts() {
        let jobs = vec![
            job_with(JobStatus::Pending),
            job_with(JobStatus::Pending),
            job_with(JobStatus::Processing),
            job_with(JobStatus::Completed),
            job_with(JobStatus::Failed),
            job_with(JobStatus::Failed),
            job_with(JobStatus::Failed),
        ];

        let counts = StatusCounts::from_jobs(&jobs);

        assert_eq!(
            counts,
            StatusCounts {
                pending: 2,
                processing: 1,
                completed: 1,
                failed: 3,
                total: 7,
            }
        );
        assert_eq!(StatusCounts::from_jobs(&[]), StatusCounts::default());
    }

    #[test]
    fn test_job_metrics_from_job() {
        let mut job = job_with(JobStatus::Pending);
        job.start().unwrap();
        job.record_progress(42.5);

        let metrics = JobMetrics::from(&job);
        assert_eq!(metrics.id, job.id);
        assert_eq!(metrics.source_path, "/videos/a.mov");
        assert_eq!(metrics.progress, 42.5);
        assert!(metrics.started_at.is_some());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = MetricsSnapshot {
            queue_len: 3,
            running_jobs: 2,
            max_concurrent_jobs: 2,
            watch_folder: Some("/videos".to_string()),
            ..MetricsSnapshot::default()
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["queue_len"], 3);
        assert_eq!(value["running_jobs"], 2);
        assert_eq!(value["counts"]["pending"], 0);
        assert_eq!(value["watch_folder"], "/videos");
        assert!(value["system"]["cpu_usage_percent"].is_number());
    }

    #[test]
    fn test_collect_system_metrics_in_range() {
        let system = collect_system_metrics();
        assert!(system.mem_usage_percent >= 0.0 && system.mem_usage_percent <= 100.0);
        assert!(system.cpu_usage_percent >= 0.0);
    }
}
