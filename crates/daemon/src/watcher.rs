//! Folder watcher for transcoderd
//!
//! Watches a directory tree with the OS file watcher and reports each newly
//! created video file to a callback exactly once.
//!
//! A path is claimed in the in-flight set as soon as its creation event
//! arrives, before the settle delay starts. Further events for the same path are
//! dropped while it is claimed, so a burst of duplicate creation events yields a
//! single callback. After the callback returns the path stays claimed for the
//! release delay. The in-flight set lives in memory only; the orchestrator's
//! record check is what dedups across restarts.

use crate::scan::VideoExtensions;
use log::{debug, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use transcoderd_config::WatchConfig;

/// Error type for watcher operations
#[derive(Debug, Error)]
pub enum WatchError {
    /// Watched folder does not exist or is not a directory
    #[error("Watch folder not found: {}", .0.display())]
    FolderMissing(PathBuf),

    /// The OS watcher could not be set up
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Invoked once per settled new file.
pub type WatchCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// How long to wait for a new file to stop changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    /// Fixed wait after the creation event.
    pub delay: Duration,
    /// Wait between size/mtime observations.
    pub poll_interval: Duration,
    /// Observation attempts before giving up and proceeding. 0 = fixed delay only.
    pub max_polls: u32,
}

impl SettlePolicy {
    pub fn from_config(config: &WatchConfig) -> Self {
        let delay = Duration::from_millis(config.settle_delay_ms);
        Self {
            delay,
            poll_interval: delay.min(Duration::from_secs(1)),
            max_polls: config.max_settle_polls,
        }
    }
}

/// What to watch and how.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRegistration {
    pub folder: PathBuf,
    pub extensions: VideoExtensions,
    pub settle: SettlePolicy,
    /// How long a reported path stays claimed after its callback.
    pub release_delay: Duration,
}

impl WatchRegistration {
    pub fn from_config(folder: impl Into<PathBuf>, config: &WatchConfig) -> Self {
        Self {
            folder: folder.into(),
            extensions: VideoExtensions::from_config(config),
            settle: SettlePolicy::from_config(config),
            release_delay: Duration::from_millis(config.release_delay_ms),
        }
    }
}

/// Paths currently being settled or dispatched.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a path. Returns false if it was already claimed.
    pub fn claim(&self, path: &Path) -> bool {
        self.lock().insert(path.to_path_buf())
    }

    pub fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Result of waiting for a file to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// Two successive observations matched.
    Stable,
    /// Still changing after the last poll; processed anyway.
    StillChanging,
    /// The file disappeared.
    Vanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    size: u64,
    modified: Option<SystemTime>,
}

async fn observe(path: &Path) -> Option<Observation> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some(Observation {
        size: metadata.len(),
        modified: metadata.modified().ok(),
    })
}

/// Waits the settle delay, then polls size and mtime until they stop changing.
pub async fn settle(path: &Path, policy: &SettlePolicy) -> Settled {
    sleep(policy.delay).await;

    let mut last = match observe(path).await {
        Some(observation) => observation,
        None => return Settled::Vanished,
    };

    for _ in 0..policy.max_polls {
        sleep(policy.poll_interval).await;
        let next = match observe(path).await {
            Some(observation) => observation,
            None => return Settled::Vanished,
        };
        if next == last {
            return Settled::Stable;
        }
        last = next;
    }

    if policy.max_polls == 0 {
        Settled::Stable
    } else {
        Settled::StillChanging
    }
}

/// A running watch on one folder.
pub struct FolderWatcher {
    folder: PathBuf,
    watcher: Option<RecommendedWatcher>,
    shutdown: oneshot::Sender<()>,
    listener: JoinHandle<()>,
    in_flight: InFlightSet,
}

impl FolderWatcher {
    /// Start watching `registration.folder` recursively.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        registration: WatchRegistration,
        callback: WatchCallback,
    ) -> Result<Self, WatchError> {
        if !registration.folder.is_dir() {
            return Err(WatchError::FolderMissing(registration.folder));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // Closed receiver means the listener is shutting down.
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&registration.folder, RecursiveMode::Recursive)?;

        info!("Watching {} for new video files", registration.folder.display());
        Ok(Self::with_events(registration, callback, rx, Some(watcher)))
    }

    fn with_events(
        registration: WatchRegistration,
        callback: WatchCallback,
        events: mpsc::UnboundedReceiver<notify::Result<Event>>,
        watcher: Option<RecommendedWatcher>,
    ) -> Self {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let in_flight = InFlightSet::new();
        let folder = registration.folder.clone();
        let listener = Listener {
            registration,
            callback,
            in_flight: in_flight.clone(),
        };
        let listener = tokio::spawn(listener.run(events, shutdown_rx));

        Self {
            folder,
            watcher,
            shutdown,
            listener,
            in_flight,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    /// Stop watching. No callback runs after this returns.
    pub async fn stop(self) {
        let FolderWatcher {
            folder,
            watcher,
            shutdown,
            listener,
            ..
        } = self;

        drop(watcher);
        let _ = shutdown.send(());
        if let Err(e) = listener.await {
            warn!("Watcher for {} ended abnormally: {}", folder.display(), e);
        }
        info!("Stopped watching {}", folder.display());
    }
}

struct Listener {
    registration: WatchRegistration,
    callback: WatchCallback,
    in_flight: InFlightSet,
}

impl Listener {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut settles = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(Ok(event)) => self.handle_event(event, &mut settles),
                    Some(Err(e)) => warn!("File watcher error: {}", e),
                    None => break,
                },
                Some(joined) = settles.join_next(), if !settles.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Settle task failed: {}", e);
                    }
                }
            }
        }

        // Waits for a callback already in progress, cancels the rest.
        settles.shutdown().await;
    }

    fn handle_event(&self, event: Event, settles: &mut JoinSet<()>) {
        if !matches!(event.kind, EventKind::Create(_)) {
            return;
        }

        for path in event.paths {
            if path.is_dir() || !self.registration.extensions.matches(&path) {
                continue;
            }
            if !self.in_flight.claim(&path) {
                debug!("{} is already being handled", path.display());
                continue;
            }

            debug!("New file {}", path.display());
            settles.spawn(settle_and_report(
                path,
                self.registration.settle,
                self.registration.release_delay,
                self.in_flight.clone(),
                Arc::clone(&self.callback),
            ));
        }
    }
}

async fn settle_and_report(
    path: PathBuf,
    policy: SettlePolicy,
    release_delay: Duration,
    in_flight: InFlightSet,
    callback: WatchCallback,
) {
    match settle(&path, &policy).await {
        Settled::Vanished => {
            debug!("{} disappeared before it settled", path.display());
            in_flight.release(&path);
            return;
        }
        Settled::StillChanging => warn!(
            "{} still changing after {} checks; processing anyway",
            path.display(),
            policy.max_polls
        ),
        Settled::Stable => {}
    }

    callback(&path);

    sleep(release_delay).await;
    in_flight.release(&path);
}

/// Holds at most one active watch. Changing the watch stops the old one first.
pub struct WatchSlot {
    callback: WatchCallback,
    current: Option<FolderWatcher>,
}

impl WatchSlot {
    pub fn new(callback: WatchCallback) -> Self {
        Self {
            callback,
            current: None,
        }
    }

    /// Stop the current watch, then start `next` if given.
    ///
    /// On error the slot is left empty.
    pub async fn replace(&mut self, next: Option<WatchRegistration>) -> Result<(), WatchError> {
        self.stop().await;
        if let Some(registration) = next {
            let watcher = FolderWatcher::start(registration, Arc::clone(&self.callback))?;
            self.current = Some(watcher);
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(watcher) = self.current.take() {
            watcher.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    pub fn folder(&self) -> Option<&Path> {
        self.current.as_ref().map(FolderWatcher::folder)
    }
}
