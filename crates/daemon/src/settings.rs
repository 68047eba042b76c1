//! User-editable settings.
//!
//! Encode parameters and the watch folder live in a string key-value store
//! behind [`SettingsProvider`]. The engine reads it per job and per watch
//! reconfiguration, never once at startup, so changes apply to later work
//! without a restart.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

pub const SOURCE_FOLDER: &str = "source_folder";
pub const OUTPUT_FOLDER: &str = "output_folder";
pub const WATCH_ENABLED: &str = "watch_enabled";
pub const OUTPUT_FORMAT: &str = "output_format";
pub const VIDEO_CODEC: &str = "video_codec";
pub const AUDIO_CODEC: &str = "audio_codec";
pub const PRESET: &str = "preset";
pub const CRF: &str = "crf";

pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
pub const DEFAULT_PRESET: &str = "medium";
pub const DEFAULT_CRF: u32 = 23;
pub const DEFAULT_OUTPUT_FORMAT: &str = "mp4";

/// Error type for settings operations.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to (de)serialize settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// String key-value settings store.
pub trait SettingsProvider: Send + Sync {
    /// Current value for `key`, or `default` when unset.
    fn get(&self, key: &str, default: &str) -> String;

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
}

/// Settings held in memory only.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<'a>(values: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let values = values
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }
}

impl SettingsProvider for MemorySettings {
    fn get(&self, key: &str, default: &str) -> String {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings persisted as a flat JSON object, rewritten on every `set`.
#[derive(Debug)]
pub struct JsonSettings {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl JsonSettings {
    /// Opens the settings file, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsProvider for JsonSettings {
    fn get(&self, key: &str, default: &str) -> String {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        let mut next = values.clone();
        next.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&next)?)?;
        fs::rename(&tmp, &self.path)?;

        *values = next;
        Ok(())
    }
}

/// Encode parameters resolved for one job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeParams {
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub crf: u32,
    pub output_format: String,
    /// Output directory; `None` means next to the source file.
    pub output_dir: Option<PathBuf>,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            preset: DEFAULT_PRESET.to_string(),
            crf: DEFAULT_CRF,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            output_dir: None,
        }
    }
}

impl EncodeParams {
    /// Takes a snapshot of the current settings, filling defaults for unset keys.
    pub fn snapshot(settings: &dyn SettingsProvider) -> Self {
        let crf_raw = settings.get(CRF, &DEFAULT_CRF.to_string());
        let crf = crf_raw.trim().parse::<u32>().unwrap_or_else(|_| {
            warn!("Invalid crf setting {:?}, using {}", crf_raw, DEFAULT_CRF);
            DEFAULT_CRF
        });

        let output_dir = settings.get(OUTPUT_FOLDER, "");
        let output_format = settings.get(OUTPUT_FORMAT, DEFAULT_OUTPUT_FORMAT);

        Self {
            video_codec: non_blank(
                settings.get(VIDEO_CODEC, DEFAULT_VIDEO_CODEC),
                DEFAULT_VIDEO_CODEC,
            ),
            audio_codec: non_blank(
                settings.get(AUDIO_CODEC, DEFAULT_AUDIO_CODEC),
                DEFAULT_AUDIO_CODEC,
            ),
            preset: non_blank(settings.get(PRESET, DEFAULT_PRESET), DEFAULT_PRESET),
            crf,
            output_format: non_blank(
                output_format.trim_start_matches('.').to_string(),
                DEFAULT_OUTPUT_FORMAT,
            ),
            output_dir: (!output_dir.trim().is_empty()).then(|| PathBuf::from(output_dir.trim())),
        }
    }

    /// `{output_dir}/{source_stem}_transcoded.{output_format}`.
    ///
    /// Without an output directory the file lands next to the source.
    pub fn output_path_for(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        dir.join(format!("{}_transcoded.{}", stem, self.output_format))
    }
}

fn non_blank(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value.trim().to_string()
    }
}

/// Watch folder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    pub source_folder: Option<PathBuf>,
    pub enabled: bool,
}

impl WatchSettings {
    pub fn snapshot(settings: &dyn SettingsProvider) -> Self {
        let folder = settings.get(SOURCE_FOLDER, "");
        Self {
            source_folder: (!folder.trim().is_empty()).then(|| PathBuf::from(folder.trim())),
            enabled: settings.get(WATCH_ENABLED, "false").trim() == "true",
        }
    }

    /// Folder to watch, if watching is enabled and a folder is configured.
    pub fn active_folder(&self) -> Option<&Path> {
        if self.enabled {
            self.source_folder.as_deref()
        } else {
            None
        }
    }
}

/// A full settings update as submitted by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub source_folder: String,
    pub output_folder: String,
    pub watch_enabled: bool,
    pub output_format: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub crf: u32,
}

impl Default for SettingsUpdate {
    fn default() -> Self {
        Self {
            source_folder: String::new(),
            output_folder: String::new(),
            watch_enabled: false,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            preset: DEFAULT_PRESET.to_string(),
            crf: DEFAULT_CRF,
        }
    }
}

impl SettingsUpdate {
    /// Writes every key of the update.
    pub fn apply(&self, settings: &dyn SettingsProvider) -> Result<(), SettingsError> {
        settings.set(SOURCE_FOLDER, &self.source_folder)?;
        settings.set(OUTPUT_FOLDER, &self.output_folder)?;
        settings.set(WATCH_ENABLED, if self.watch_enabled { "true" } else { "false" })?;
        settings.set(OUTPUT_FORMAT, &self.output_format)?;
        settings.set(VIDEO_CODEC, &self.video_codec)?;
        settings.set(AUDIO_CODEC, &self.audio_codec)?;
        settings.set(PRESET, &self.preset)?;
        settings.set(CRF, &self.crf.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_defaults() {
        let settings = MemorySettings::new();
        let params = EncodeParams::snapshot(&settings);
        assert_eq!(params, EncodeParams::default());
        assert_eq!(params.video_codec, "libx264");
        assert_eq!(params.crf, 23);
    }

    #[test]
    fn test_snapshot_reads_values() {
        let settings = MemorySettings::with_values([
            (VIDEO_CODEC, "libx265"),
            (AUDIO_CODEC, "opus"),
            (PRESET, "slow"),
            (CRF, "28"),
            (OUTPUT_FORMAT, ".mkv"),
            (OUTPUT_FOLDER, "/out"),
        ]);
        let params = EncodeParams::snapshot(&settings);
        assert_eq!(params.video_codec, "libx265");
        assert_eq!(params.audio_codec, "opus");
        assert_eq!(params.preset, "slow");
        assert_eq!(params.crf, 28);
        assert_eq!(params.output_format, "mkv");
        assert_eq!(params.output_dir, Some(PathBuf::from("/out")));
    }

    #[test]
    fn test_invalid_crf_falls_back() {
        let settings = MemorySettings::with_values([(CRF, "high")]);
        assert_eq!(EncodeParams::snapshot(&settings).crf, DEFAULT_CRF);
    }

    #[test]
    fn test_snapshot_is_detached_from_later_changes() {
        let settings = MemorySettings::with_values([(PRESET, "fast")]);
        let params = EncodeParams::snapshot(&settings);
        settings.set(PRESET, "veryslow").unwrap();
        assert_eq!(params.preset, "fast");
        assert_eq!(EncodeParams::snapshot(&settings).preset, "veryslow");
    }

    #[test]
    fn test_output_path_for() {
        let params = EncodeParams {
            output_dir: Some(PathBuf::from("/out")),
            ..EncodeParams::default()
        };
        assert_eq!(
            params.output_path_for(Path::new("/videos/a.mov")),
            PathBuf::from("/out/a_transcoded.mp4")
        );
        assert_eq!(
            params.output_path_for(Path::new("/videos/show.s01e01.mkv")),
            PathBuf::from("/out/show.s01e01_transcoded.mp4")
        );

        let beside = EncodeParams::default();
        assert_eq!(
            beside.output_path_for(Path::new("/videos/a.mov")),
            PathBuf::from("/videos/a_transcoded.mp4")
        );
    }

    #[test]
    fn test_watch_settings() {
        let settings = MemorySettings::new();
        let watch = WatchSettings::snapshot(&settings);
        assert!(!watch.enabled);
        assert!(watch.active_folder().is_none());

        settings.set(SOURCE_FOLDER, "/incoming").unwrap();
        settings.set(WATCH_ENABLED, "true").unwrap();
        let watch = WatchSettings::snapshot(&settings);
        assert_eq!(watch.active_folder(), Some(Path::new("/incoming")));

        settings.set(WATCH_ENABLED, "yes").unwrap();
        assert!(!WatchSettings::snapshot(&settings).enabled);
    }

    #[test]
    fn test_json_settings_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/settings.json");

        {
            let settings = JsonSettings::open(&path).unwrap();
            assert_eq!(settings.get(PRESET, "medium"), "medium");
            SettingsUpdate {
                source_folder: "/incoming".to_string(),
                watch_enabled: true,
                crf: 30,
                ..SettingsUpdate::default()
            }
            .apply(&settings)
            .unwrap();
        }

        let settings = JsonSettings::open(&path).unwrap();
        assert_eq!(settings.get(SOURCE_FOLDER, ""), "/incoming");
        assert_eq!(settings.get(WATCH_ENABLED, "false"), "true");
        assert_eq!(settings.get(CRF, "23"), "30");
        assert_eq!(EncodeParams::snapshot(&settings).crf, 30);
    }

    #[test]
    fn test_settings_update_deserializes_partial_json() {
        let update: SettingsUpdate =
            serde_json::from_str(r#"{"source_folder": "/in", "watch_enabled": true}"#).unwrap();
        assert_eq!(update.source_folder, "/in");
        assert!(update.watch_enabled);
        assert_eq!(update.crf, 23);
        assert_eq!(update.video_codec, "libx264");
    }
}
