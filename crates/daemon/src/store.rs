//! Job persistence.
//!
//! The orchestrator only needs create/read/update/query/delete on job records,
//! so storage sits behind the [`JobStore`] trait. Two implementations ship with
//! the daemon: [`MemoryJobStore`] for tests and embedding, and [`JsonJobStore`]
//! which keeps one `{id}.json` file per job in a state directory.
//!
//! Both enforce the live-path rule inside `create`: while a `pending` or
//! `processing` job exists for a source path, creating another one for the same
//! path fails with [`StoreError::LiveJobExists`]. The check and the insert happen
//! under one write lock, which is what keeps racing submissions from producing
//! two live jobs.

use crate::jobs::{Job, JobStatus};
use log::warn;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

/// Error type for job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No job with this id.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The job is owned by a running execution and cannot be deleted.
    #[error("Cannot delete job {0} while it is processing")]
    Processing(String),

    /// A live job already exists for the source path.
    #[error("A live job already exists for {}: {}", .0.source_path.display(), .0.id)]
    LiveJobExists(Box<Job>),

    /// IO error while persisting a job.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize a job record.
    #[error("Failed to serialize job: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Storage for job records.
pub trait JobStore: Send + Sync {
    /// Assigns an id and stores a new job. Fails with
    /// [`StoreError::LiveJobExists`] if a live job shares the source path.
    fn create(&self, job: Job) -> Result<Job, StoreError>;

    fn get(&self, id: &str) -> Option<Job>;

    /// The live job for a path if there is one, otherwise the newest record.
    fn find_by_source_path(&self, path: &Path) -> Option<Job>;

    /// Jobs with the given status (all jobs for `None`), newest first.
    fn list_by_status(&self, status: Option<JobStatus>) -> Vec<Job>;

    /// Replaces a stored job. Fails with [`StoreError::NotFound`] if the id is unknown.
    fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Removes a job and returns it. `processing` jobs are rejected.
    fn delete(&self, id: &str) -> Result<Job, StoreError>;
}

/// In-memory job table shared by both store implementations.
#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<String, Job>,
}

impl JobTable {
    fn live_for(&self, path: &Path) -> Option<&Job> {
        self.jobs
            .values()
            .find(|job| job.is_live() && job.has_source(path))
    }

    fn prepare_create(&self, mut job: Job) -> Result<Job, StoreError> {
        if let Some(existing) = self.live_for(&job.source_path) {
            return Err(StoreError::LiveJobExists(Box::new(existing.clone())));
        }
        job.id = Uuid::new_v4().to_string();
        Ok(job)
    }

    fn check_update(&self, job: &Job) -> Result<(), StoreError> {
        if self.jobs.contains_key(&job.id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(job.id.clone()))
        }
    }

    fn check_delete(&self, id: &str) -> Result<(), StoreError> {
        match self.jobs.get(id) {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(job) if job.status == JobStatus::Processing => {
                Err(StoreError::Processing(id.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    fn find_by_source_path(&self, path: &Path) -> Option<Job> {
        if let Some(live) = self.live_for(path) {
            return Some(live.clone());
        }
        self.jobs
            .values()
            .filter(|job| job.has_source(path))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned()
    }

    fn list_by_status(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }
}

fn read_table(lock: &RwLock<JobTable>) -> RwLockReadGuard<'_, JobTable> {
    // A panic while holding the lock cannot leave a half-written job in the map.
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_table(lock: &RwLock<JobTable>) -> RwLockWriteGuard<'_, JobTable> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Job store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: RwLock<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut table = write_table(&self.table);
        let job = table.prepare_create(job)?;
        table.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    fn get(&self, id: &str) -> Option<Job> {
        read_table(&self.table).jobs.get(id).cloned()
    }

    fn find_by_source_path(&self, path: &Path) -> Option<Job> {
        read_table(&self.table).find_by_source_path(path)
    }

    fn list_by_status(&self, status: Option<JobStatus>) -> Vec<Job> {
        read_table(&self.table).list_by_status(status)
    }

    fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut table = write_table(&self.table);
        table.check_update(job)?;
        table.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<Job, StoreError> {
        let mut table = write_table(&self.table);
        table.check_delete(id)?;
        table
            .jobs
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Job store persisting each job as `{id}.json` in a state directory.
///
/// Records are cached in memory; every mutation is written through to disk
/// before the cache changes.
#[derive(Debug)]
pub struct JsonJobStore {
    state_dir: PathBuf,
    table: RwLock<JobTable>,
}

impl JsonJobStore {
    /// Opens (creating if needed) a state directory and loads existing jobs.
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;

        let mut table = JobTable::default();
        for job in load_jobs(&state_dir)? {
            table.jobs.insert(job.id.clone(), job);
        }

        Ok(Self {
            state_dir,
            table: RwLock::new(table),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn job_file(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }
}

impl JobStore for JsonJobStore {
    fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut table = write_table(&self.table);
        let job = table.prepare_create(job)?;
        save_job(&job, &self.state_dir)?;
        table.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    fn get(&self, id: &str) -> Option<Job> {
        read_table(&self.table).jobs.get(id).cloned()
    }

    fn find_by_source_path(&self, path: &Path) -> Option<Job> {
        read_table(&self.table).find_by_source_path(path)
    }

    fn list_by_status(&self, status: Option<JobStatus>) -> Vec<Job> {
        read_table(&self.table).list_by_status(status)
    }

    fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut table = write_table(&self.table);
        table.check_update(job)?;
        save_job(job, &self.state_dir)?;
        table.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<Job, StoreError> {
        let mut table = write_table(&self.table);
        table.check_delete(id)?;
        match fs::remove_file(self.job_file(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        table
            .jobs
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Writes a job to `{state_dir}/{id}.json` through a temp file and rename, so a
/// crash never leaves a truncated record behind.
fn save_job(job: &Job, state_dir: &Path) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(job)?;
    let file_path = state_dir.join(format!("{}.json", job.id));
    let tmp_path = state_dir.join(format!(".{}.json.tmp", job.id));
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &file_path)?;
    Ok(())
}

/// Loads all jobs from JSON files in the state directory.
fn load_jobs(state_dir: &Path) -> Result<Vec<Job>, io::Error> {
    let mut jobs = Vec::new();

    for entry in fs::read_dir(state_dir)? {
        let path = entry?.path();

        // Only process .json files
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match load_job_from_file(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Failed to load job from {}: {}", path.display(), e),
        }
    }

    Ok(jobs)
}

fn load_job_from_file(path: &Path) -> Result<Job, io::Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn stores() -> (TempDir, Vec<Box<dyn JobStore>>) {
        let dir = TempDir::new().unwrap();
        let json = JsonJobStore::open(dir.path().join("jobs")).unwrap();
        (dir, vec![Box::new(MemoryJobStore::new()), Box::new(json)])
    }

    fn processing(store: &dyn JobStore, path: &str) -> Job {
        let mut job = store.create(Job::new(path)).unwrap();
        job.start().unwrap();
        store.update(&job).unwrap();
        job
    }

    #[test]
    fn test_create_assigns_id() {
        let (_dir, stores) = stores();
        for store in &stores {
            let job = store.create(Job::new("/videos/a.mov")).unwrap();
            assert_eq!(job.id.len(), 36);
            assert_eq!(store.get(&job.id), Some(job));
        }
    }

    #[test]
    fn test_create_rejects_second_live_job() {
        let (_dir, stores) = stores();
        for store in &stores {
            let first = store.create(Job::new("/videos/a.mov")).unwrap();
            match store.create(Job::new("/videos/a.mov")) {
                Err(StoreError::LiveJobExists(existing)) => assert_eq!(existing.id, first.id),
                other => panic!("expected LiveJobExists, got {:?}", other),
            }
            assert_eq!(store.list_by_status(None).len(), 1);
        }
    }

    #[test]
    fn test_terminal_job_allows_resubmission() {
        let (_dir, stores) = stores();
        for store in &stores {
            let mut old = processing(store.as_ref(), "/videos/a.mov");
            old.fail("ffmpeg exited with code 1").unwrap();
            store.update(&old).unwrap();

            let fresh = store.create(Job::new("/videos/a.mov")).unwrap();
            assert_ne!(fresh.id, old.id);
            assert_eq!(
                store.find_by_source_path(Path::new("/videos/a.mov")).map(|j| j.id),
                Some(fresh.id)
            );
        }
    }

    #[test]
    fn test_find_by_source_path_returns_newest_historical() {
        let (_dir, stores) = stores();
        for store in &stores {
            let mut older = processing(store.as_ref(), "/videos/b.mkv");
            older.complete(PathBuf::from("/out/b_transcoded.mp4")).unwrap();
            older.created_at -= 10_000;
            store.update(&older).unwrap();

            let mut newer = processing(store.as_ref(), "/videos/b.mkv");
            newer.fail("boom").unwrap();
            store.update(&newer).unwrap();

            let found = store.find_by_source_path(Path::new("/videos/b.mkv")).unwrap();
            assert_eq!(found.id, newer.id);
            assert!(store.find_by_source_path(Path::new("/videos/c.mkv")).is_none());
        }
    }

    #[test]
    fn test_list_by_status_filters_and_orders() {
        let (_dir, stores) = stores();
        for store in &stores {
            let mut a = store.create(Job::new("/videos/a.mov")).unwrap();
            a.created_at = 1_000;
            store.update(&a).unwrap();
            let mut b = store.create(Job::new("/videos/b.mov")).unwrap();
            b.created_at = 2_000;
            store.update(&b).unwrap();
            let c = processing(store.as_ref(), "/videos/c.mov");

            let all = store.list_by_status(None);
            assert_eq!(all.len(), 3);
            assert_eq!(all[0].id, c.id);
            assert_eq!(all[2].id, a.id);

            let pending = store.list_by_status(Some(JobStatus::Pending));
            assert_eq!(pending.iter().map(|j| &j.id).collect::<Vec<_>>(), vec![&b.id, &a.id]);
            assert!(store.list_by_status(Some(JobStatus::Failed)).is_empty());
        }
    }

    #[test]
    fn test_update_unknown_job() {
        let (_dir, stores) = stores();
        for store in &stores {
            let mut job = Job::new("/videos/a.mov");
            job.id = "missing".to_string();
            assert!(matches!(store.update(&job), Err(StoreError::NotFound(_))));
        }
    }

    #[test]
    fn test_delete_rules() {
        let (_dir, stores) = stores();
        for store in &stores {
            let running = processing(store.as_ref(), "/videos/a.mov");
            assert!(matches!(store.delete(&running.id), Err(StoreError::Processing(_))));
            assert_eq!(store.get(&running.id).unwrap().status, JobStatus::Processing);

            let pending = store.create(Job::new("/videos/b.mov")).unwrap();
            assert_eq!(store.delete(&pending.id).unwrap().id, pending.id);

            let mut done = processing(store.as_ref(), "/videos/c.mov");
            done.complete(PathBuf::from("/out/c.mp4")).unwrap();
            store.update(&done).unwrap();
            store.delete(&done.id).unwrap();

            let mut failed = processing(store.as_ref(), "/videos/d.mov");
            failed.fail("boom").unwrap();
            store.update(&failed).unwrap();
            store.delete(&failed.id).unwrap();

            let remaining: Vec<String> =
                store.list_by_status(None).into_iter().map(|j| j.id).collect();
            assert_eq!(remaining, vec![running.id.clone()]);
            assert!(matches!(store.delete("nope"), Err(StoreError::NotFound(_))));
        }
    }

    #[test]
    fn test_json_store_reloads_jobs() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("jobs");

        let (kept, deleted) = {
            let store = JsonJobStore::open(&state_dir).unwrap();
            let mut kept = store.create(Job::new("/videos/a.mov")).unwrap();
            kept.start().unwrap();
            kept.record_progress(42.0);
            store.update(&kept).unwrap();
            let deleted = store.create(Job::new("/videos/b.mov")).unwrap();
            store.delete(&deleted.id).unwrap();
            (kept, deleted)
        };

        // Junk next to the records is ignored.
        fs::write(state_dir.join("garbage.json"), "{ not json").unwrap();
        fs::write(state_dir.join("notes.txt"), "hello").unwrap();

        let store = JsonJobStore::open(&state_dir).unwrap();
        assert_eq!(store.get(&kept.id), Some(kept.clone()));
        assert!(store.get(&deleted.id).is_none());
        assert_eq!(store.list_by_status(None).len(), 1);
        assert!(state_dir.join(format!("{}.json", kept.id)).exists());
    }

    #[test]
    fn test_concurrent_creates_yield_one_live_job() {
        let store = Arc::new(MemoryJobStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.create(Job::new("/videos/race.mkv")).is_ok())
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(created, 1);
        assert_eq!(store.list_by_status(Some(JobStatus::Pending)).len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Whatever order paths are submitted and finished in, no path ever has two live jobs.
        #[test]
        fn prop_at_most_one_live_job_per_path(
            ops in prop::collection::vec((0usize..4, proptest::bool::ANY), 1..40),
        ) {
            let store = MemoryJobStore::new();
            let paths = ["/v/a.mkv", "/v/b.mkv", "/v/c.mkv", "/v/d.mkv"];

            for (index, finish) in ops {
                let path = Path::new(paths[index]);
                if finish {
                    if let Some(mut job) = store.find_by_source_path(path).filter(|j| j.is_live()) {
                        if job.status == JobStatus::Pending {
                            job.start().unwrap();
                        }
                        job.complete(PathBuf::from("/out/x.mp4")).unwrap();
                        store.update(&job).unwrap();
                    }
                } else {
                    let _ = store.create(Job::new(path));
                }

                for p in paths {
                    let live = store
                        .list_by_status(None)
                        .into_iter()
                        .filter(|j| j.is_live() && j.has_source(Path::new(p)))
                        .count();
                    prop_assert!(live <= 1);
                }
            }
        }
    }
}
