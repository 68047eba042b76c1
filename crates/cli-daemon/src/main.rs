//! CLI entry point for transcoderd
//!
//! Parses command line arguments, initializes logging and runs the daemon
//! until Ctrl-C.

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use transcoderd::{Config, Daemon, DaemonError};

/// transcoderd - watch folders and transcode new videos with ffmpeg
#[derive(Parser, Debug)]
#[command(name = "transcoderd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults apply if missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip the ffmpeg/ffprobe availability checks. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Queue untracked videos in the configured source folder before watching
    #[arg(long, default_value = "false")]
    scan_on_start: bool,
}

fn build_daemon(args: &Args) -> Result<Daemon, DaemonError> {
    let config = Config::load_or_default(&args.config)?;
    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::with_config(config)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    info!("transcoderd starting");
    info!("Config file: {}", args.config.display());

    let daemon = match build_daemon(&args) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "State directory: {}, {} max concurrent jobs ({} cores)",
        daemon.config.jobs.state_dir.display(),
        daemon.concurrency_plan.max_concurrent_jobs,
        daemon.concurrency_plan.total_cores
    );

    if let Err(e) = daemon.initialize().await {
        error!("Startup recovery failed: {}", e);
        return ExitCode::FAILURE;
    }

    if args.scan_on_start {
        match daemon.scan_source_folder() {
            Ok(_) => {}
            Err(DaemonError::NoSourceFolder) => {
                warn!("--scan-on-start given but no source folder is configured")
            }
            Err(e) => error!("Initial scan failed: {}", e),
        }
    }

    if let Err(e) = daemon.serve(shutdown_signal()).await {
        error!("Daemon error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
