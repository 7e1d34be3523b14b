//! Archive creation with bounded retry.
//!
//! Each attempt streams the sources through the pipeline into
//! `<destination>.partial` on a blocking thread. Only a completed pipeline is
//! renamed to the destination, so a half-written file never carries the
//! final artifact name.

use super::{ArchiveArtifact, ArchiveError, PackReport, Pipeline};
use crate::crypto::Passphrase;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PARTIAL_SUFFIX: &str = ".partial";

/// Delay strategy between archive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Exponential {
        initial: Duration,
        factor: u32,
        max: Duration,
    },
}

impl Backoff {
    /// Delay after the `failed_attempt`-th failure (1-based)
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                factor,
                max,
            } => {
                let exponent = failed_attempt.saturating_sub(1);
                factor
                    .checked_pow(exponent)
                    .and_then(|multiplier| initial.checked_mul(multiplier))
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(10),
                factor: 2,
                max: Duration::from_secs(120),
            },
        }
    }
}

/// What to archive and where.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub sources: Vec<PathBuf>,
    pub excludes: Vec<PathBuf>,
    pub destination: PathBuf,
    pub level: i32,
}

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub artifact: ArchiveArtifact,
    /// Attempts used, including the successful one
    pub attempts: u32,
    pub report: PackReport,
}

impl ArchiveOutcome {
    /// Entries left out of an otherwise successful archive
    pub fn warnings(&self) -> &[String] {
        &self.report.skipped
    }
}

#[derive(Error, Debug)]
#[error("archive failed after {attempts} attempt(s): {last_error}")]
pub struct ArchiveFailure {
    pub attempts: u32,
    pub last_error: String,
    /// Retrying stopped because shutdown was requested
    pub interrupted: bool,
}

impl ArchiveError {
    /// Failures that another attempt cannot fix
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ArchiveError::Empty | ArchiveError::Encryption(_))
    }
}

/// Where an attempt writes before the final rename
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Creates encrypted archives, retrying transient failures.
pub struct ArchiveBuilder {
    pipeline: Pipeline,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl ArchiveBuilder {
    pub fn new(pipeline: Pipeline, policy: RetryPolicy) -> Self {
        Self {
            pipeline,
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop waiting between attempts once `shutdown` is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn create(
        &self,
        request: &ArchiveRequest,
        passphrase: &Passphrase,
    ) -> Result<ArchiveOutcome, ArchiveFailure> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(
                attempt,
                max_attempts,
                "Creating archive {}",
                request.destination.display()
            );

            match self.attempt(request, passphrase).await {
                Ok((report, artifact)) => {
                    info!(
                        attempt,
                        entries = report.entries,
                        "Archive created: {} ({})",
                        artifact.path.display(),
                        crate::utils::format::format_bytes(artifact.size)
                    );
                    return Ok(ArchiveOutcome {
                        artifact,
                        attempts: attempt,
                        report,
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    if !e.is_retryable() {
                        error!(attempt, "Archive attempt failed permanently: {}", e);
                        return Err(ArchiveFailure {
                            attempts: attempt,
                            last_error,
                            interrupted: false,
                        });
                    }
                    warn!(attempt, max_attempts, "Archive attempt failed: {}", e);
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.backoff.delay(attempt);
                info!(attempt, "Retrying archive in {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => {
                        warn!("Shutdown requested, abandoning archive retries");
                        return Err(ArchiveFailure {
                            attempts: attempt,
                            last_error,
                            interrupted: true,
                        });
                    }
                }
            }
        }

        Err(ArchiveFailure {
            attempts: max_attempts,
            last_error,
            interrupted: false,
        })
    }

    async fn attempt(
        &self,
        request: &ArchiveRequest,
        passphrase: &Passphrase,
    ) -> Result<(PackReport, ArchiveArtifact), ArchiveError> {
        let pipeline = self.pipeline.clone();
        let request = request.clone();
        let passphrase = passphrase.clone();

        tokio::task::spawn_blocking(move || write_artifact(&pipeline, &request, &passphrase))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))?
    }
}

#[cfg(unix)]
fn open_partial(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_partial(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create(true).truncate(true).open(path)
}

fn write_artifact(
    pipeline: &Pipeline,
    request: &ArchiveRequest,
    passphrase: &Passphrase,
) -> Result<(PackReport, ArchiveArtifact), ArchiveError> {
    let partial = partial_path(&request.destination);
    let file = open_partial(&partial)?;

    let written = pipeline
        .write(
            &request.sources,
            &request.excludes,
            file,
            request.level,
            passphrase,
        )
        .and_then(|report| {
            fs::rename(&partial, &request.destination)?;
            Ok(report)
        });

    match written {
        Ok(report) => {
            let artifact = ArchiveArtifact::from_path(&request.destination)?;
            Ok((report, artifact))
        }
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(&partial) {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", partial.display(), remove_err);
                }
            }
            Err(e)
        }
    }
}
