//! Scanner module for discovering video files in a source folder.
//!
//! Provides the extension allowlist shared with the folder watcher and a
//! recursive directory walk used by explicit scans.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use transcoderd_config::{WatchConfig, DEFAULT_VIDEO_EXTENSIONS};
use walkdir::WalkDir;

/// Case-insensitive set of video file extensions (stored without the dot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoExtensions {
    extensions: BTreeSet<String>,
}

impl VideoExtensions {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { extensions }
    }

    /// Extensions from the watch configuration; the built-in list if it is empty.
    pub fn from_config(config: &WatchConfig) -> Self {
        let configured = Self::new(&config.extensions);
        if configured.extensions.is_empty() {
            Self::default()
        } else {
            configured
        }
    }

    /// Checks if a path has an allowed extension (case-insensitive).
    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(&ext.to_lowercase()))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }
}

impl Default for VideoExtensions {
    fn default() -> Self {
        Self::new(DEFAULT_VIDEO_EXTENSIONS)
    }
}

/// Recursively collects every regular file under `root` with an allowed extension.
///
/// Unreadable entries are skipped. Results are sorted so scans are deterministic.
pub fn find_video_files(root: &Path, extensions: &VideoExtensions) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| extensions.matches(entry.path()))
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}
