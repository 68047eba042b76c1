//! Startup checks module for transcoderd
//!
//! Preflight checks run before the daemon starts taking jobs:
//! - ffmpeg is available and reports a version
//! - ffprobe is available (duration probing degrades without it)

use log::{info, warn};
use std::process::Command;
use thiserror::Error;
use transcoderd_config::FfmpegConfig;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),
}

/// Parse FFmpeg version string and extract the version token
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
/// - Git builds: "ffmpeg version N-113281-g1f0c8d8 ..." (returned as-is)
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_ascii_lowercase().contains("version"))?;

    let start = version_line.to_ascii_lowercase().find("version")? + "version".len();
    let token = version_line[start..].split_whitespace().next()?;

    // Release tags look like `n6.1`; git snapshots start with `N-`.
    let token = match token.strip_prefix('n') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
        _ => token,
    };
    Some(token.to_string())
}

/// Run `<program> -version` and return its first output line.
fn run_version(program: &str) -> Result<String, String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            format!(
                "{} -version failed; is it installed and in PATH? Error: {}",
                program, e
            )
        })?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", program, output.status));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().to_string())
}

/// Check that ffmpeg runs and report its version
pub fn check_ffmpeg_available(cfg: &FfmpegConfig) -> Result<String, StartupError> {
    let first_line = run_version(&cfg.ffmpeg_path).map_err(StartupError::FfmpegUnavailable)?;
    let version = parse_ffmpeg_version(&first_line).ok_or_else(|| {
        StartupError::FfmpegUnavailable(format!(
            "Could not parse version from output: {}",
            if first_line.is_empty() { "(empty)" } else { first_line.as_str() }
        ))
    })?;
    Ok(version)
}

/// Check that ffprobe runs
pub fn check_ffprobe_available(cfg: &FfmpegConfig) -> Result<(), StartupError> {
    run_version(&cfg.ffprobe_path)
        .map(|_| ())
        .map_err(StartupError::FfprobeUnavailable)
}

/// Run all startup checks in order
///
/// A missing ffmpeg aborts startup. A missing ffprobe only means progress
/// cannot be computed, so it is logged and startup continues.
pub fn run_startup_checks(cfg: &FfmpegConfig) -> Result<(), StartupError> {
    let version = check_ffmpeg_available(cfg)?;
    info!("Using {} (version {})", cfg.ffmpeg_path, version);

    if let Err(e) = check_ffprobe_available(cfg) {
        warn!("{}; job progress will only be reported on completion", e);
    }
    Ok(())
}
