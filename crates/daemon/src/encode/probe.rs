//! Duration probing with ffprobe.

use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Total duration of a media file in seconds.
///
/// Runs `ffprobe -v quiet -print_format json -show_format <path>`.
pub async fn probe_duration(ffprobe: &str, path: &Path) -> Result<f64, ProbeError> {
    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_ffprobe_duration(&String::from_utf8_lossy(&output.stdout))
}

/// Extracts `format.duration` from ffprobe JSON output.
pub fn parse_ffprobe_duration(json_str: &str) -> Result<f64, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let raw = ffprobe
        .format
        .and_then(|format| format.duration)
        .ok_or_else(|| ProbeError::ParseError("Missing format.duration".to_string()))?;

    let duration = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| ProbeError::ParseError(format!("Invalid duration {:?}: {}", raw, e)))?;

    if duration.is_finite() && duration >= 0.0 {
        Ok(duration)
    } else {
        Err(ProbeError::ParseError(format!("Invalid duration {:?}", raw)))
    }
}
