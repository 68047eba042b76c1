//! ffmpeg-backed [`Encoder`]
//!
//! Spawns ffmpeg with `-progress pipe:1` and turns the `out_time_ms` key/value
//! lines on stdout into percent-complete events against the probed duration.

use super::probe::probe_duration;
use super::{EncodeError, EncodeHandle, EncodeRequest, Encoder, ProgressEvent};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedSender};
use transcoderd_config::FfmpegConfig;

/// Number of trailing stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 8;

/// Encoder that shells out to ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    config: Arc<FfmpegConfig>,
}

impl FfmpegEncoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn start(&self, request: EncodeRequest) -> EncodeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Arc::clone(&self.config);
        let outcome = tokio::spawn(async move { run_ffmpeg(request, &config, tx).await });
        EncodeHandle {
            progress: rx,
            outcome,
        }
    }
}

/// Build the ffmpeg command for one encode
///
/// `ffmpeg -i <src> -c:v <codec> -preset <p> -crf <n> -c:a <codec> -b:a <rate>
/// -movflags +faststart -y -progress pipe:1 <out>`, with stdout and stderr piped.
pub fn build_ffmpeg_command(request: &EncodeRequest, config: &FfmpegConfig) -> Command {
    let params = &request.params;
    let mut cmd = Command::new(&config.ffmpeg_path);

    cmd.arg("-hide_banner").arg("-nostdin");
    cmd.arg("-i").arg(&request.source_path);

    cmd.arg("-c:v").arg(&params.video_codec);
    cmd.arg("-preset").arg(&params.preset);
    cmd.arg("-crf").arg(params.crf.to_string());

    cmd.arg("-c:a").arg(&params.audio_codec);
    cmd.arg("-b:a").arg(&config.audio_bitrate);

    cmd.arg("-movflags").arg("+faststart");
    cmd.arg("-y");

    // Machine-readable progress on stdout; stderr keeps the error text.
    cmd.arg("-progress").arg("pipe:1").arg("-nostats");

    cmd.arg(&request.output_path);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd
}

/// Parse an `out_time_ms=` / `out_time_us=` progress line.
///
/// Both keys carry microseconds. Returns `None` for any other line, for
/// `N/A`, and for the negative timestamps ffmpeg can emit before the first frame.
pub fn parse_progress_line(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    match key.trim() {
        "out_time_ms" | "out_time_us" => value.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Percent complete for `out_time_us` against a total duration in seconds.
///
/// `None` when the duration is unknown (zero, negative or not finite).
pub fn progress_percent(out_time_us: u64, duration_secs: f64) -> Option<f64> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return None;
    }
    let elapsed = out_time_us as f64 / 1_000_000.0;
    Some((elapsed / duration_secs * 100.0).clamp(0.0, 100.0))
}

async fn run_ffmpeg(
    request: EncodeRequest,
    config: &FfmpegConfig,
    tx: UnboundedSender<ProgressEvent>,
) -> Result<PathBuf, EncodeError> {
    check_source_readable(&request.source_path).await?;

    let duration = match probe_duration(&config.ffprobe_path, &request.source_path).await {
        Ok(duration) => duration,
        Err(e) => {
            warn!(
                "Could not probe duration of {}: {}; progress will jump to 100 on completion",
                request.source_path.display(),
                e
            );
            0.0
        }
    };

    info!(
        "Encoding {} -> {} ({} / {} preset {} crf {})",
        request.source_path.display(),
        request.output_path.display(),
        request.params.video_codec,
        request.params.audio_codec,
        request.params.preset,
        request.params.crf
    );

    let mut cmd = build_ffmpeg_command(&request, config);
    let mut child = cmd.spawn().map_err(|source| EncodeError::Spawn {
        program: config.ffmpeg_path.clone(),
        source,
    })?;

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(stderr_tail(stderr)));

    if let Some(stdout) = child.stdout.take() {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        while let Some(line) = read_lossy_line(&mut reader, &mut buf).await? {
            let percent = parse_progress_line(&line).and_then(|us| progress_percent(us, duration));
            if let Some(percent) = percent {
                // Receiver gone means nobody is listening; keep encoding.
                let _ = tx.send(ProgressEvent::new(percent));
            }
        }
    }

    let status = child.wait().await?;
    let tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if status.success() {
        let _ = tx.send(ProgressEvent::complete());
        debug!("ffmpeg finished {}", request.output_path.display());
        Ok(request.output_path)
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::NonZeroExit {
                code,
                stderr_tail: if tail.is_empty() {
                    "no error output".to_string()
                } else {
                    tail
                },
            }),
            None => Err(EncodeError::Terminated),
        }
    }
}

async fn check_source_readable(path: &Path) -> Result<(), EncodeError> {
    tokio::fs::File::open(path)
        .await
        .map(|_| ())
        .map_err(|source| EncodeError::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        })
}

/// Reads one line, replacing invalid UTF-8. `None` at EOF.
///
/// ffmpeg echoes file names and metadata verbatim, so its output is not
/// guaranteed to be UTF-8.
async fn read_lossy_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Drains stderr to EOF, keeping the last few non-empty lines.
async fn stderr_tail<R: AsyncRead + Unpin>(stderr: R) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        let line = match read_lossy_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Stopped reading ffmpeg stderr: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
    Vec::from(tail).join("\n")
}
