//! Job record and lifecycle state machine.
//!
//! A job moves `pending → processing → {completed | failed}`. The transition
//! methods on [`Job`] are the only way the orchestrator mutates a record, so the
//! invariants (timestamps set once and in order, monotonic progress, terminal
//! states final) hold regardless of which store persists the job.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting for a worker slot.
    Pending,
    /// Job is owned by a running execution.
    Processing,
    /// Job finished and produced an output file.
    Completed,
    /// Job failed; the error message says why.
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// Rejected state machine transition. The job is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {id} cannot move from {from} to {to}")]
pub struct JobTransitionError {
    pub id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One requested conversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Store-assigned identifier (UUID). Empty until the job is created in a store.
    pub id: String,
    /// Path to the source video file.
    pub source_path: PathBuf,
    /// Path of the encoded file, set only on success.
    pub output_path: Option<PathBuf>,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Percent complete, 0.0 to 100.0.
    pub progress: f64,
    /// Failure diagnostic, set only on failure.
    pub error_message: Option<String>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when an execution took ownership.
    pub started_at: Option<i64>,
    /// Unix timestamp (milliseconds) when the job reached a terminal state.
    pub completed_at: Option<i64>,
}

impl Job {
    /// Creates a `pending` job for a source path. The id is assigned by the store.
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            id: String::new(),
            source_path: source_path.into(),
            output_path: None,
            status: JobStatus::Pending,
            progress: 0.0,
            error_message: None,
            created_at: current_timestamp_ms(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Live jobs are `pending` or `processing`.
    pub fn is_live(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Processing)
    }

    /// Terminal jobs are `completed` or `failed`; no further transitions occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn has_source(&self, path: &Path) -> bool {
        self.source_path == path
    }

    /// `pending → processing`, recording the start time.
    pub fn start(&mut self) -> Result<(), JobTransitionError> {
        self.check_transition(JobStatus::Pending, JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.started_at = Some(current_timestamp_ms());
        Ok(())
    }

    /// Records a progress value while `processing`.
    ///
    /// Values are clamped to 0–100; lower values than the current one and NaN
    /// are ignored. Returns true if the stored progress changed.
    pub fn record_progress(&mut self, percent: f64) -> bool {
        if self.status != JobStatus::Processing || percent.is_nan() {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent <= self.progress {
            return false;
        }
        self.progress = percent;
        true
    }

    /// `processing → completed` with the produced output path.
    pub fn complete(&mut self, output_path: PathBuf) -> Result<(), JobTransitionError> {
        self.check_transition(JobStatus::Processing, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.output_path = Some(output_path);
        self.progress = 100.0;
        self.completed_at = Some(current_timestamp_ms());
        Ok(())
    }

    /// `pending | processing → failed`. Progress keeps its last value.
    pub fn fail(&mut self, reason: &str) -> Result<(), JobTransitionError> {
        if !self.is_live() {
            return Err(self.transition_error(JobStatus::Failed));
        }
        self.status = JobStatus::Failed;
        self.error_message = Some(if reason.trim().is_empty() {
            "unknown error".to_string()
        } else {
            reason.to_string()
        });
        self.completed_at = Some(current_timestamp_ms());
        Ok(())
    }

    /// Human-readable description of the current state.
    pub fn status_message(&self) -> String {
        match self.status {
            JobStatus::Pending => "Waiting to start".to_string(),
            JobStatus::Processing => format!("Transcoding ({:.1}%)", self.progress),
            JobStatus::Completed => match &self.output_path {
                Some(path) => format!("Completed: {}", path.display()),
                None => "Completed".to_string(),
            },
            JobStatus::Failed => format!(
                "Failed: {}",
                self.error_message.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    fn check_transition(&self, from: JobStatus, to: JobStatus) -> Result<(), JobTransitionError> {
        if self.status == from {
            Ok(())
        } else {
            Err(self.transition_error(to))
        }
    }

    fn transition_error(&self, to: JobStatus) -> JobTransitionError {
        JobTransitionError {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
