//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Video extensions matched by the watcher and the scanner when none are configured.
pub const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mkv", "mov", "flv", "wmv", "m4v", "webm", "mpg", "mpeg",
];

/// External encoder tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FfmpegConfig {
    /// Path or name of the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Path or name of the ffprobe binary
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Audio bitrate passed to `-b:a`
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

/// Job execution and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Directory holding job records and persisted settings
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Maximum concurrent encodes (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Number of logical cores (auto-detected if None)
    #[serde(default)]
    pub logical_cores: Option<u32>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/transcoderd")
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_concurrent_jobs: 0,
            logical_cores: None,
        }
    }
}

/// Folder watch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Wait before a newly created file is first inspected
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// How long a delivered path stays in the in-flight set
    #[serde(default = "default_release_delay_ms")]
    pub release_delay_ms: u64,
    /// Size/mtime stability polls after the settle delay (0 = fixed delay only)
    #[serde(default = "default_max_settle_polls")]
    pub max_settle_polls: u32,
    /// Extensions (without dot, case-insensitive) treated as video files
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_release_delay_ms() -> u64 {
    1000
}

fn default_max_settle_polls() -> u32 {
    5
}

fn default_extensions() -> Vec<String> {
    DEFAULT_VIDEO_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            release_delay_ms: default_release_delay_ms(),
            max_settle_polls: default_max_settle_polls(),
            extensions: default_extensions(),
        }
    }
}

/// Metrics server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Bind address of the read-only metrics endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: default_metrics_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FFMPEG_PATH -> ffmpeg.ffmpeg_path
    /// - FFPROBE_PATH -> ffmpeg.ffprobe_path
    /// - TRANSCODER_AUDIO_BITRATE -> ffmpeg.audio_bitrate
    /// - TRANSCODER_STATE_DIR -> jobs.state_dir
    /// - TRANSCODER_MAX_CONCURRENT_JOBS -> jobs.max_concurrent_jobs
    /// - TRANSCODER_LOGICAL_CORES -> jobs.logical_cores
    /// - TRANSCODER_SETTLE_DELAY_MS -> watch.settle_delay_ms
    /// - TRANSCODER_RELEASE_DELAY_MS -> watch.release_delay_ms
    /// - TRANSCODER_MAX_SETTLE_POLLS -> watch.max_settle_polls
    /// - TRANSCODER_METRICS_ADDR -> server.metrics_addr
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = non_empty_var("FFMPEG_PATH") {
            self.ffmpeg.ffmpeg_path = val;
        }

        if let Some(val) = non_empty_var("FFPROBE_PATH") {
            self.ffmpeg.ffprobe_path = val;
        }

        if let Some(val) = non_empty_var("TRANSCODER_AUDIO_BITRATE") {
            self.ffmpeg.audio_bitrate = val;
        }

        if let Some(val) = non_empty_var("TRANSCODER_STATE_DIR") {
            self.jobs.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("TRANSCODER_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("TRANSCODER_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.jobs.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("TRANSCODER_SETTLE_DELAY_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.watch.settle_delay_ms = ms;
            }
        }

        if let Ok(val) = env::var("TRANSCODER_RELEASE_DELAY_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.watch.release_delay_ms = ms;
            }
        }

        if let Ok(val) = env::var("TRANSCODER_MAX_SETTLE_POLLS") {
            if let Ok(polls) = val.parse::<u32>() {
                self.watch.max_settle_polls = polls;
            }
        }

        if let Some(val) = non_empty_var("TRANSCODER_METRICS_ADDR") {
            self.server.metrics_addr = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    /// (environment overrides still apply).
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Directory where job records are persisted
    pub fn jobs_dir(&self) -> PathBuf {
        self.jobs.state_dir.join("jobs")
    }

    /// File where the settings key-value store is persisted
    pub fn settings_file(&self) -> PathBuf {
        self.jobs.state_dir.join("settings.json")
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "FFMPEG_PATH",
            "FFPROBE_PATH",
            "TRANSCODER_AUDIO_BITRATE",
            "TRANSCODER_STATE_DIR",
            "TRANSCODER_MAX_CONCURRENT_JOBS",
            "TRANSCODER_LOGICAL_CORES",
            "TRANSCODER_SETTLE_DELAY_MS",
            "TRANSCODER_RELEASE_DELAY_MS",
            "TRANSCODER_MAX_SETTLE_POLLS",
            "TRANSCODER_METRICS_ADDR",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            ffmpeg_path in "[a-z/]{1,30}",
            max_jobs in 0u32..16,
            logical_cores in proptest::option::of(1u32..256),
            settle in 0u64..60_000,
            release in 0u64..60_000,
            polls in 0u32..20,
            port in 1024u16..65535,
        ) {
            let toml_str = format!(
                r#"
[ffmpeg]
ffmpeg_path = "{}"

[jobs]
state_dir = "/tmp/state"
max_concurrent_jobs = {}
{}

[watch]
settle_delay_ms = {}
release_delay_ms = {}
max_settle_polls = {}

[server]
metrics_addr = "127.0.0.1:{}"
"#,
                ffmpeg_path,
                max_jobs,
                logical_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default(),
                settle,
                release,
                polls,
                port,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.ffmpeg.ffmpeg_path, &ffmpeg_path);
            prop_assert_eq!(config.ffmpeg.ffprobe_path.as_str(), "ffprobe");
            prop_assert_eq!(config.jobs.state_dir, PathBuf::from("/tmp/state"));
            prop_assert_eq!(config.jobs.max_concurrent_jobs, max_jobs);
            prop_assert_eq!(config.jobs.logical_cores, logical_cores);
            prop_assert_eq!(config.watch.settle_delay_ms, settle);
            prop_assert_eq!(config.watch.release_delay_ms, release);
            prop_assert_eq!(config.watch.max_settle_polls, polls);
            prop_assert_eq!(config.server.metrics_addr, format!("127.0.0.1:{}", port));
        }

        #[test]
        fn prop_env_overrides_max_concurrent_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[jobs]
max_concurrent_jobs = {}
"#,
                initial_jobs
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TRANSCODER_MAX_CONCURRENT_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.jobs.max_concurrent_jobs, override_jobs);
        }

        #[test]
        fn prop_env_overrides_settle_delay(
            initial in 0u64..10_000,
            override_ms in 0u64..10_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[watch]\nsettle_delay_ms = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TRANSCODER_SETTLE_DELAY_MS", override_ms.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.watch.settle_delay_ms, override_ms);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.ffmpeg.ffmpeg_path, "ffmpeg");
        assert_eq!(config.ffmpeg.ffprobe_path, "ffprobe");
        assert_eq!(config.ffmpeg.audio_bitrate, "192k");
        assert_eq!(config.jobs.max_concurrent_jobs, 0);
        assert_eq!(config.jobs.logical_cores, None);
        assert_eq!(config.watch.settle_delay_ms, 2000);
        assert_eq!(config.watch.release_delay_ms, 1000);
        assert_eq!(config.watch.max_settle_polls, 5);
        assert_eq!(config.watch.extensions.len(), DEFAULT_VIDEO_EXTENSIONS.len());
        assert_eq!(config.server.metrics_addr, "127.0.0.1:7878");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[watch]
extensions = ["mkv"]
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.watch.extensions, vec!["mkv".to_string()]);
        assert_eq!(config.watch.settle_delay_ms, 2000); // default
        assert_eq!(config.ffmpeg, FfmpegConfig::default());
        assert_eq!(config.jobs, JobsConfig::default());
    }

    #[test]
    fn test_env_overrides_tool_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("FFPROBE_PATH", "  ");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.ffmpeg.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        // blank values are ignored
        assert_eq!(config.ffmpeg.ffprobe_path, "ffprobe");
    }

    #[test]
    fn test_invalid_numeric_override_keeps_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TRANSCODER_MAX_SETTLE_POLLS", "many");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.watch.max_settle_polls, 5);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml"))
            .expect("missing file should fall back to defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[jobs\nmax_concurrent_jobs = ").unwrap();

        match Config::load_or_default(&path) {
            Err(ConfigError::Parse(_)) => {}
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_state_paths() {
        let mut config = Config::default();
        config.jobs.state_dir = PathBuf::from("/srv/transcoderd");
        assert_eq!(config.jobs_dir(), PathBuf::from("/srv/transcoderd/jobs"));
        assert_eq!(
            config.settings_file(),
            PathBuf::from("/srv/transcoderd/settings.json")
        );
    }
}
