//! Transcode orchestrator for transcoderd
//!
//! Turns submissions into job records and runs each job on its own tokio task.
//! A semaphore bounds how many encodes run at once; dispatched jobs wait in
//! `pending` until they get a slot.
//!
//! Job lifecycle: `pending → processing → completed | failed`. Each job has a
//! single writer once it starts (its own task), so no orchestrator-wide lock is
//! needed. Duplicate submissions are resolved by the store, which refuses to
//! create a second live job for the same source path.

use crate::concurrency::ConcurrencyPlan;
use crate::encode::{EncodeRequest, Encoder};
use crate::jobs::{Job, JobStatus};
use crate::metrics::{MetricsSnapshot, SharedMetrics, StatusCounts};
use crate::scan::{find_video_files, VideoExtensions};
use crate::settings::{EncodeParams, SettingsProvider};
use crate::store::{JobStore, StoreError};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Error message recorded on jobs found `processing` at startup.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: daemon stopped while processing";

/// Smallest progress change, in percent, that is written to the store.
const PROGRESS_SAVE_STEP: f64 = 1.0;

/// Error type for orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Submitted path does not exist or is not a file
    #[error("Source file not found: {}", .0.display())]
    SourceMissing(PathBuf),

    /// Scan root does not exist or is not a directory
    #[error("Folder not found: {}", .0.display())]
    FolderMissing(PathBuf),

    /// No job with this id
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Running jobs cannot be deleted
    #[error("Cannot delete job {0} while it is processing")]
    JobInProgress(String),

    /// Job store failure
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    /// A new `pending` job was created and dispatched.
    Created(Job),
    /// A live job already existed for the path; nothing was created.
    Existing(Job),
}

impl Submitted {
    pub fn job(&self) -> &Job {
        match self {
            Submitted::Created(job) | Submitted::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Submitted::Created(_))
    }
}

/// Result of a directory scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub new_jobs: Vec<Job>,
}

impl ScanReport {
    pub fn count(&self) -> usize {
        self.new_jobs.len()
    }
}

/// Creates, dispatches and tracks transcode jobs.
///
/// Cheap to clone; clones share the store, the worker pool and the metrics.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    settings: Arc<dyn SettingsProvider>,
    encoder: Arc<dyn Encoder>,
    semaphore: Arc<Semaphore>,
    max_concurrent_jobs: usize,
    metrics: SharedMetrics,
    extensions: VideoExtensions,
    /// Ids with a dispatched task that has not finished yet.
    dispatched: Arc<Mutex<HashSet<String>>>,
}

impl Orchestrator {
    /// Create a new Orchestrator
    ///
    /// # Arguments
    /// * `store` - Job records
    /// * `settings` - Read at job start for the encode parameters
    /// * `encoder` - Runs the actual encodes
    /// * `plan` - Concurrency plan determining the worker pool size
    /// * `metrics` - Shared metrics state for queue depth and running count
    pub fn new(
        store: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsProvider>,
        encoder: Arc<dyn Encoder>,
        plan: &ConcurrencyPlan,
        metrics: SharedMetrics,
    ) -> Self {
        let permits = plan.max_concurrent_jobs.max(1) as usize;
        Self {
            store,
            settings,
            encoder,
            semaphore: Arc::new(Semaphore::new(permits)),
            max_concurrent_jobs: permits,
            metrics,
            extensions: VideoExtensions::default(),
            dispatched: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Replace the extension allowlist used by scans.
    pub fn with_extensions(mut self, extensions: VideoExtensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn extensions(&self) -> &VideoExtensions {
        &self.extensions
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Submit a source file for transcoding.
    ///
    /// Idempotent: if a live job already exists for the path it is returned as
    /// [`Submitted::Existing`]. Must be called from within a tokio runtime.
    pub fn submit(&self, source_path: impl AsRef<Path>) -> Result<Submitted, OrchestratorError> {
        let source_path = source_path.as_ref();
        if !source_path.is_file() {
            return Err(OrchestratorError::SourceMissing(source_path.to_path_buf()));
        }

        match self.store.create(Job::new(source_path)) {
            Ok(job) => {
                info!("Job {} created for {}", job.id, source_path.display());
                self.dispatch(&job);
                Ok(Submitted::Created(job))
            }
            Err(StoreError::LiveJobExists(existing)) => {
                debug!(
                    "{} already has live job {} ({})",
                    source_path.display(),
                    existing.id,
                    existing.status
                );
                Ok(Submitted::Existing(*existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Spawn the task that runs a `pending` job once a worker slot is free.
    ///
    /// The task re-reads the job after getting a slot and does nothing if the
    /// job was deleted or is no longer `pending`. Dispatching a job that
    /// already has a task in flight is a no-op.
    pub fn dispatch(&self, job: &Job) -> JoinHandle<()> {
        let this = self.clone();
        let id = job.id.clone();
        if !self.lock_dispatched().insert(id.clone()) {
            debug!("Job {} is already dispatched", id);
            return tokio::spawn(async {});
        }
        tokio::spawn(async move {
            this.execute(&id).await;
            this.lock_dispatched().remove(&id);
        })
    }

    fn lock_dispatched(&self) -> MutexGuard<'_, HashSet<String>> {
        self.dispatched.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Entry point for the folder watcher.
    ///
    /// Paths with any existing record, including finished or failed ones, are
    /// ignored, as are outputs of known jobs. Returns the created job, if any.
    pub fn on_new_file_detected(&self, path: &Path) -> Result<Option<Job>, OrchestratorError> {
        if let Some(existing) = self.store.find_by_source_path(path) {
            debug!(
                "Ignoring {}: already tracked as job {} ({})",
                path.display(),
                existing.id,
                existing.status
            );
            return Ok(None);
        }
        if let Some(owner) = self.output_owner(path) {
            debug!("Ignoring {}: output of job {}", path.display(), owner.id);
            return Ok(None);
        }

        match self.submit(path)? {
            Submitted::Created(job) => Ok(Some(job)),
            Submitted::Existing(_) => Ok(None),
        }
    }

    /// The job that wrote, or will write, `path` as its output.
    ///
    /// Unfinished jobs are matched on the output path the current settings
    /// give them, since ffmpeg creates the file before the job records it.
    fn output_owner(&self, path: &Path) -> Option<Job> {
        let params = EncodeParams::snapshot(self.settings.as_ref());
        self.store.list_by_status(None).into_iter().find(|job| match &job.output_path {
            Some(output) => output == path,
            None => params.output_path_for(&job.source_path) == path,
        })
    }

    /// Walk `root` recursively and submit every video file with no record yet.
    pub fn scan_directory(&self, root: &Path) -> Result<ScanReport, OrchestratorError> {
        if !root.is_dir() {
            return Err(OrchestratorError::FolderMissing(root.to_path_buf()));
        }

        let mut report = ScanReport::default();
        for path in find_video_files(root, &self.extensions) {
            match self.on_new_file_detected(&path) {
                Ok(Some(job)) => report.new_jobs.push(job),
                Ok(None) => {}
                Err(e) => warn!("Skipping {} during scan: {}", path.display(), e),
            }
        }

        info!(
            "Scan of {} queued {} new job(s)",
            root.display(),
            report.count()
        );
        Ok(report)
    }

    /// Delete a job record. `processing` jobs are rejected.
    pub fn delete_job(&self, id: &str) -> Result<Job, OrchestratorError> {
        match self.store.delete(id) {
            Ok(job) => {
                info!("Job {} deleted ({})", job.id, job.status);
                Ok(job)
            }
            Err(StoreError::NotFound(id)) => Err(OrchestratorError::NotFound(id)),
            Err(StoreError::Processing(id)) => Err(OrchestratorError::JobInProgress(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.store.get(id)
    }

    /// Jobs newest first, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.store.list_by_status(status)
    }

    pub fn status_counts(&self) -> StatusCounts {
        StatusCounts::from_jobs(&self.store.list_by_status(None))
    }

    /// Mark every job left `processing` by a previous run as failed.
    ///
    /// Call once at startup, before any dispatch. Returns how many were marked.
    pub fn reconcile_orphans(&self) -> Result<usize, OrchestratorError> {
        let orphans = self.store.list_by_status(Some(JobStatus::Processing));
        let count = orphans.len();
        for mut job in orphans {
            if job.fail(INTERRUPTED_MESSAGE).is_ok() {
                warn!(
                    "Job {} for {} was interrupted; marked failed",
                    job.id,
                    job.source_path.display()
                );
                self.store.update(&job)?;
            }
        }
        Ok(count)
    }

    /// Dispatch every `pending` job, oldest first.
    pub fn resume_pending(&self) -> Vec<JoinHandle<()>> {
        let mut pending = self.store.list_by_status(Some(JobStatus::Pending));
        pending.reverse();
        if !pending.is_empty() {
            info!("Resuming {} pending job(s)", pending.len());
        }
        pending.iter().map(|job| self.dispatch(job)).collect()
    }

    async fn execute(&self, id: &str) {
        self.adjust_metrics(|m| m.queue_len += 1).await;
        let permit = Arc::clone(&self.semaphore).acquire_owned().await;
        self.adjust_metrics(|m| m.queue_len = m.queue_len.saturating_sub(1))
            .await;

        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Worker pool closed; job {} stays pending", id);
                return;
            }
        };

        self.adjust_metrics(|m| m.running_jobs += 1).await;
        self.run_job(id).await;
        self.adjust_metrics(|m| m.running_jobs = m.running_jobs.saturating_sub(1))
            .await;
    }

    async fn run_job(&self, id: &str) {
        let mut job = match self.store.get(id) {
            Some(job) if job.status == JobStatus::Pending => job,
            Some(job) => {
                debug!("Job {} is {}; not starting it", id, job.status);
                return;
            }
            None => {
                info!("Job {} was deleted before it started", id);
                return;
            }
        };

        let params = EncodeParams::snapshot(self.settings.as_ref());
        let output_path = params.output_path_for(&job.source_path);

        if let Some(dir) = output_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                let reason =
                    format!("Failed to create output directory {}: {}", dir.display(), e);
                self.finish_failed(job, &reason);
                return;
            }
        }

        if let Err(e) = job.start() {
            warn!("{}", e);
            return;
        }
        // Fails if the job was deleted since it was read.
        if let Err(e) = self.store.update(&job) {
            warn!("Job {} could not be started: {}", id, e);
            return;
        }
        info!(
            "Job {} processing: {} -> {}",
            id,
            job.source_path.display(),
            output_path.display()
        );

        let mut handle = self.encoder.start(EncodeRequest {
            source_path: job.source_path.clone(),
            output_path,
            params,
        });

        // Store writes are throttled to whole-percent steps; the terminal
        // write below carries the exact last value.
        let mut saved_progress = job.progress;
        while let Some(event) = handle.progress.recv().await {
            if job.record_progress(event.percent)
                && job.progress - saved_progress >= PROGRESS_SAVE_STEP
            {
                debug!("Job {} at {:.1}%", id, job.progress);
                self.persist(&job);
                saved_progress = job.progress;
            }
        }

        let outcome = match handle.outcome.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("Encoder task failed: {}", e)),
        };

        match outcome {
            Ok(output) => match job.complete(output) {
                Ok(()) => {
                    info!("Job {} completed: {}", id, job.status_message());
                    self.persist(&job);
                }
                Err(e) => warn!("{}", e),
            },
            Err(reason) => self.finish_failed(job, &reason),
        }
    }

    fn finish_failed(&self, mut job: Job, reason: &str) {
        match job.fail(reason) {
            Ok(()) => {
                error!(
                    "Job {} for {} failed: {}",
                    job.id,
                    job.source_path.display(),
                    reason
                );
                self.persist(&job);
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Store write failures stay local to the job that hit them.
    fn persist(&self, job: &Job) {
        if let Err(e) = self.store.update(job) {
            warn!("Failed to persist job {}: {}", job.id, e);
        }
    }

    async fn adjust_metrics(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        let mut metrics = self.metrics.write().await;
        f(&mut metrics);
    }
}
