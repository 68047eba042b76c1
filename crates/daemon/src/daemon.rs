//! Daemon wiring for transcoderd
//!
//! Builds the store, settings, encoder, orchestrator and watcher from a
//! [`Config`], recovers state left by a previous run, applies settings
//! updates and runs the background metrics tasks.

use crate::concurrency::ConcurrencyPlan;
use crate::config::{Config, ConfigError};
use crate::encode::{Encoder, FfmpegEncoder};
use crate::jobs::{current_timestamp_ms, JobStatus};
use crate::metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, SharedMetrics, StatusCounts,
};
use crate::metrics_server::{parse_metrics_addr, run_metrics_server, ServerError};
use crate::orchestrator::{Orchestrator, OrchestratorError, ScanReport};
use crate::scan::VideoExtensions;
use crate::settings::{
    JsonSettings, SettingsError, SettingsProvider, SettingsUpdate, WatchSettings,
};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{JobStore, JsonJobStore, StoreError};
use crate::watcher::{WatchCallback, WatchError, WatchRegistration, WatchSlot};
use log::{error, info, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

const METRICS_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Metrics server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// A settings update named a source folder that does not exist
    #[error("Source folder does not exist: {}", .0.display())]
    SourceFolderMissing(PathBuf),

    #[error("Failed to create output folder {}: {source}", .path.display())]
    OutputFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No source folder configured")]
    NoSourceFolder,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    settings: Arc<dyn SettingsProvider>,
    orchestrator: Orchestrator,
    watch: Mutex<WatchSlot>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// Loads the config (a missing file means defaults), applies environment
    /// overrides, runs the ffmpeg availability checks and opens the state
    /// directory.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config.ffmpeg)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffmpeg is not available.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let store = Arc::new(JsonJobStore::open(config.jobs_dir())?);
        let settings = Arc::new(JsonSettings::open(config.settings_file())?);
        let encoder = Arc::new(FfmpegEncoder::new(config.ffmpeg.clone()));
        Ok(Self::from_parts(config, store, settings, encoder))
    }

    /// Assemble a daemon from already-built components.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsProvider>,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        let concurrency_plan = ConcurrencyPlan::derive(&config.jobs);
        let metrics = new_shared_metrics();
        let orchestrator = Orchestrator::new(
            store,
            Arc::clone(&settings),
            encoder,
            &concurrency_plan,
            metrics.clone(),
        )
        .with_extensions(VideoExtensions::from_config(&config.watch));

        let watch = Mutex::new(WatchSlot::new(watch_callback(orchestrator.clone())));

        Self {
            config,
            concurrency_plan,
            metrics,
            settings,
            orchestrator,
            watch,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn settings(&self) -> &Arc<dyn SettingsProvider> {
        &self.settings
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Folder currently being watched, if any.
    pub async fn watched_folder(&self) -> Option<PathBuf> {
        self.watch.lock().await.folder().map(Path::to_path_buf)
    }

    /// Recover from the previous run and start watching.
    ///
    /// Jobs left `processing` are marked failed, `pending` jobs are
    /// redispatched, then the watch from the persisted settings is applied.
    /// A watch that cannot be started is logged; the daemon keeps running.
    pub async fn initialize(&self) -> Result<Vec<JoinHandle<()>>, DaemonError> {
        let orphans = self.orchestrator.reconcile_orphans()?;
        if orphans > 0 {
            warn!("Marked {} interrupted job(s) as failed", orphans);
        }
        let resumed = self.orchestrator.resume_pending();

        if let Err(e) = self.apply_watch_settings().await {
            error!("Could not start folder watcher: {}", e);
        }
        self.refresh_metrics().await;
        Ok(resumed)
    }

    /// Validate and persist a settings update, then reconfigure the watcher.
    ///
    /// Nothing is persisted when validation fails.
    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<(), DaemonError> {
        let source = update.source_folder.trim();
        if !source.is_empty() && !Path::new(source).is_dir() {
            return Err(DaemonError::SourceFolderMissing(PathBuf::from(source)));
        }

        let output = update.output_folder.trim();
        if !output.is_empty() {
            let path = PathBuf::from(output);
            if !path.is_dir() {
                std::fs::create_dir_all(&path)
                    .map_err(|source| DaemonError::OutputFolder { path: path.clone(), source })?;
                info!("Created output folder {}", path.display());
            }
        }

        update.apply(self.settings.as_ref())?;
        self.apply_watch_settings().await
    }

    /// Stop-then-replace the watcher to match the current settings.
    pub async fn apply_watch_settings(&self) -> Result<(), DaemonError> {
        let watch = WatchSettings::snapshot(self.settings.as_ref());
        let registration = watch
            .active_folder()
            .map(|folder| WatchRegistration::from_config(folder, &self.config.watch));

        let mut slot = self.watch.lock().await;
        let result = slot.replace(registration).await;
        let folder = slot.folder().map(|f| f.display().to_string());
        drop(slot);

        if folder.is_none() {
            info!("Folder watching is off");
        }
        self.metrics.write().await.watch_folder = folder;
        result.map_err(DaemonError::from)
    }

    /// Queue every untracked video file under the configured source folder.
    pub fn scan_source_folder(&self) -> Result<ScanReport, DaemonError> {
        let watch = WatchSettings::snapshot(self.settings.as_ref());
        let folder = watch.source_folder.ok_or(DaemonError::NoSourceFolder)?;
        Ok(self.orchestrator.scan_directory(&folder)?)
    }

    /// Stop the folder watcher. Running encodes are left to finish or be
    /// reconciled on the next start.
    pub async fn shutdown(&self) {
        self.watch.lock().await.stop().await;
        self.metrics.write().await.watch_folder = None;
        info!("Daemon stopped");
    }

    /// Recompute the store-derived and system parts of the metrics snapshot.
    pub async fn refresh_metrics(&self) {
        refresh_metrics(&self.orchestrator, &self.metrics).await;
    }

    /// Start the metrics HTTP server
    ///
    /// Spawns the HTTP server as a background task that stops when
    /// `shutdown` resolves.
    pub fn start_metrics_server<F>(&self, shutdown: F) -> Result<JoinHandle<()>, DaemonError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = parse_metrics_addr(&self.config.server.metrics_addr)?;
        let metrics = self.metrics.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, addr, shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    }

    /// Start the metrics update task
    ///
    /// Periodically refreshes job counts and system metrics in the shared state.
    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                refresh_metrics(&orchestrator, &metrics).await;
                tokio::time::sleep(METRICS_REFRESH_INTERVAL).await;
            }
        })
    }

    /// Initialize, then serve until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        self.initialize().await?;
        self.serve(shutdown).await
    }

    /// Run the metrics server and updater until `shutdown` resolves, then stop
    /// the watcher. Expects [`Daemon::initialize`] to have run.
    pub async fn serve<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let (server_tx, server_rx) = oneshot::channel::<()>();
        let server = self.start_metrics_server(async {
            let _ = server_rx.await;
        })?;
        let updater = self.start_metrics_updater();

        shutdown.await;
        info!("Shutdown requested");

        self.shutdown().await;
        updater.abort();
        let _ = server_tx.send(());
        let _ = server.await;
        Ok(())
    }
}

fn watch_callback(orchestrator: Orchestrator) -> WatchCallback {
    Arc::new(move |path: &Path| match orchestrator.on_new_file_detected(path) {
        Ok(Some(job)) => info!("Queued {} as job {}", path.display(), job.id),
        Ok(None) => {}
        Err(e) => warn!("Could not queue {}: {}", path.display(), e),
    })
}

async fn refresh_metrics(orchestrator: &Orchestrator, metrics: &SharedMetrics) {
    let jobs = orchestrator.list_jobs(None);
    let counts = StatusCounts::from_jobs(&jobs);
    let processing: Vec<JobMetrics> = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Processing)
        .map(JobMetrics::from)
        .collect();
    let system = collect_system_metrics();

    let mut snapshot = metrics.write().await;
    snapshot.counts = counts;
    snapshot.jobs = processing;
    snapshot.system = system;
    snapshot.max_concurrent_jobs = orchestrator.max_concurrent_jobs();
    snapshot.timestamp_unix_ms = current_timestamp_ms();
}
