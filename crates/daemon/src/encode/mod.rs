//! Encoder adapter for transcoderd
//!
//! An [`Encoder`] runs the external tool for one input/output pair. Progress is
//! delivered over a channel that closes before the terminal result resolves, so
//! a consumer that drains [`EncodeHandle::progress`] before awaiting
//! [`EncodeHandle::outcome`] sees every progress event ahead of the result.

pub mod ffmpeg;
pub mod probe;

pub use ffmpeg::{build_ffmpeg_command, parse_progress_line, progress_percent, FfmpegEncoder};
pub use probe::{parse_ffprobe_duration, probe_duration, ProbeError};

use crate::settings::EncodeParams;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Source missing or unreadable; nothing was spawned
    #[error("Source file {} is not readable: {source}", .path.display())]
    SourceUnreadable { path: PathBuf, source: io::Error },

    /// The encoder binary could not be launched
    #[error("Failed to launch {program}: {source}")]
    Spawn { program: String, source: io::Error },

    /// Encoder exited with non-zero status
    #[error("ffmpeg failed with exit code {code}: {stderr_tail}")]
    NonZeroExit { code: i32, stderr_tail: String },

    /// Encoder was killed by a signal
    #[error("ffmpeg was terminated by a signal")]
    Terminated,

    /// IO error while talking to the encoder process
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Percent-complete report from a running encode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub percent: f64,
}

impl ProgressEvent {
    pub fn new(percent: f64) -> Self {
        Self { percent }
    }

    pub fn complete() -> Self {
        Self { percent: 100.0 }
    }
}

/// One encode: source, destination and the parameter snapshot to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub params: EncodeParams,
}

/// A started encode.
#[derive(Debug)]
pub struct EncodeHandle {
    /// Progress events; closed when the encode finishes.
    pub progress: UnboundedReceiver<ProgressEvent>,
    /// Terminal result: the output path on success.
    pub outcome: JoinHandle<Result<PathBuf, EncodeError>>,
}

/// Runs encodes. Implementations spawn onto the current tokio runtime.
pub trait Encoder: Send + Sync {
    /// Starts one attempt. Every failure, including a failure to launch, is
    /// reported through [`EncodeHandle::outcome`].
    fn start(&self, request: EncodeRequest) -> EncodeHandle;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_zero_exit_message_includes_code() {
        let err = EncodeError::NonZeroExit {
            code: 1,
            stderr_tail: "Invalid data found when processing input".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "ffmpeg failed with exit code 1: Invalid data found when processing input"
        );

        let bare = EncodeError::NonZeroExit {
            code: 187,
            stderr_tail: "no error output".to_string(),
        };
        assert!(bare.to_string().contains("exit code 187"));
    }

    #[test]
    fn test_spawn_error_is_distinct() {
        let err = EncodeError::Spawn {
            program: "ffmpeg".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        };
        let message = err.to_string();
        assert!(message.starts_with("Failed to launch ffmpeg"));
        assert!(!message.contains("exit code"));
    }
}
