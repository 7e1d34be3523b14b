//! Backup Runner - Main entry point
//!
//! Runs one backup job described by a TOML file and exits with 0 on success
//! or 1 on any fatal condition.

use anyhow::{anyhow, Context, Result};
use backup_runner::config::JobConfig;
use backup_runner::daemon::ShutdownCoordinator;
use backup_runner::notify::{Notifier, RunSummary};
use backup_runner::services::docker::ShutdownMethod;
use backup_runner::services::DockerComposeRuntime;
use backup_runner::utils::logger::{self, run_log_path};
use backup_runner::{RunController, RunError};
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the job configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Walk every phase, logging side effects instead of performing them
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match JobConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            let _ = logger::init(args.log_level.as_deref().unwrap_or("info"), None);
            let err = RunError::from(e);
            error!(kind = err.kind(), "{}", err);
            return ExitCode::from(1);
        }
    };
    if args.dry_run {
        config.job.dry_run = true;
    }

    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    // Dry runs leave no log file behind
    let (log_file, log_dir_error) = if config.job.dry_run {
        (None, None)
    } else {
        match std::fs::create_dir_all(&config.job.log_dir) {
            Ok(()) => (Some(run_log_path(&config.job.log_dir, Local::now())), None),
            Err(e) => (None, Some(e)),
        }
    };
    if let Err(e) = logger::init(level, log_file.as_deref()) {
        eprintln!("backup-runner: cannot initialise logging: {:#}", e);
        return ExitCode::from(1);
    }

    info!("Starting backup-runner v{}", env!("CARGO_PKG_VERSION"));
    match (&log_file, log_dir_error) {
        (Some(path), _) => info!("Logging to {}", path.display()),
        (None, Some(e)) => warn!(
            "Cannot create log directory {}, logging to stdout only: {}",
            config.job.log_dir.display(),
            e
        ),
        (None, None) => {}
    }

    match run(config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(config: JobConfig) -> Result<u8> {
    let shutdown = ShutdownCoordinator::install()
        .context("cannot install signal handlers")?
        .spawn();

    let passphrase = config.load_passphrase().map_err(RunError::from)?;

    let method = ShutdownMethod::parse(&config.services.shutdown_method).ok_or_else(|| {
        anyhow!(
            "unknown services.shutdown_method {:?}",
            config.services.shutdown_method
        )
    })?;
    let runtime = DockerComposeRuntime::new(config.services.docker_bin.clone(), method);

    let notifier = Notifier::from_config(&config.notify);
    let dry_run = config.job.dry_run;

    let controller = RunController::new(config, passphrase, runtime).with_shutdown(shutdown);
    let outcome = controller.run().await;

    let summary = RunSummary::from_outcome(&outcome);
    match summary.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Cannot serialize run summary: {}", e),
    }

    if let Some(notifier) = notifier {
        if dry_run {
            info!("[dry-run] Would send the run summary to the notification hook");
        } else if let Err(e) = notifier.send(&summary).await {
            warn!("Notification failed: {}", e);
        }
    }

    Ok(outcome.exit_code())
}
