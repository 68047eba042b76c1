//! transcoderd
//!
//! Background service that turns source videos into encoded outputs: an
//! ffmpeg adapter, a persistent job state machine driven by a bounded worker
//! pool, and a folder watcher that queues new files as they settle.

pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod jobs;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod scan;
pub mod settings;
pub mod startup;
pub mod store;
pub mod watcher;

pub use concurrency::ConcurrencyPlan;
pub use daemon::{Daemon, DaemonError};
pub use encode::{EncodeError, EncodeHandle, EncodeRequest, Encoder, FfmpegEncoder, ProgressEvent};
pub use jobs::{Job, JobStatus, JobTransitionError};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    StatusCounts, SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use orchestrator::{Orchestrator, OrchestratorError, ScanReport, Submitted};
pub use scan::{find_video_files, VideoExtensions};
pub use settings::{
    EncodeParams, JsonSettings, MemorySettings, SettingsError, SettingsProvider, SettingsUpdate,
    WatchSettings,
};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
pub use store::{JobStore, JsonJobStore, MemoryJobStore, StoreError};
pub use transcoderd_config as config;
pub use transcoderd_config::Config;
pub use watcher::{
    FolderWatcher, InFlightSet, SettlePolicy, WatchCallback, WatchError, WatchRegistration,
    WatchSlot,
};
