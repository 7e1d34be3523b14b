//! Backup run controller - sequences one complete backup run.
//!
//! ```text
//! INIT -> LOCKED -> LOG_ROTATED -> SERVICES_STOPPED -> ARCHIVED -> VERIFIED
//!      -> PERMISSIONS_SET -> SERVICES_STARTED -> DONE
//! ```
//!
//! A failure before services are touched goes straight to FAILED. Once the
//! services phase has begun, every outcome passes through SERVICES_STARTED
//! first. Dry runs walk the same phases, logging each side effect instead of
//! performing it.

pub mod state;

use crate::archive::{ArchiveBuilder, ArchiveRequest, Pipeline, Verifier};
use crate::config::JobConfig;
use crate::crypto::Passphrase;
use crate::daemon::{InstanceLock, LockError};
use crate::fs::metadata::ArtifactPermissions;
use crate::fs::walker::{summarize, WalkOptions};
use crate::fs::{retention, space};
use crate::services::{OrchestratorSettings, ServiceOrchestrator, ServiceRuntime};
use crate::utils::format::{format_bytes, format_duration};
use crate::utils::logger::run_log_pattern;
use crate::utils::RunError;
use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use state::{Phase, RunState};

/// Suffix shared by every artifact; rotation matches on it.
pub const ARTIFACT_SUFFIX: &str = "_backup.tar.zst.enc";

/// Skipped source entries beyond this many are summarised in one warning
const MAX_SKIP_WARNINGS: usize = 20;

/// File name of the artifact for a run started at `started_at`
pub fn artifact_name(started_at: DateTime<Local>) -> String {
    format!("{}{}", started_at.format("%Y-%m-%d-%H-%M-%S"), ARTIFACT_SUFFIX)
}

pub fn artifact_pattern() -> String {
    format!("*{}", ARTIFACT_SUFFIX)
}

/// Final state of a run and the error that ended it, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    pub error: Option<RunError>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Process exit code: 0 on success (dry runs included), 1 otherwise
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

/// Top-level state machine for one backup run
pub struct RunController<R> {
    config: JobConfig,
    passphrase: Passphrase,
    orchestrator: ServiceOrchestrator<R>,
    pipeline: Pipeline,
    shutdown: CancellationToken,
}

impl<R: ServiceRuntime> RunController<R> {
    /// Create a controller using the standard archive pipeline
    pub fn new(config: JobConfig, passphrase: Passphrase, runtime: R) -> Self {
        let settings = OrchestratorSettings::from_config(&config.services);
        Self {
            config,
            passphrase,
            orchestrator: ServiceOrchestrator::new(runtime, settings),
            pipeline: Pipeline::standard(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Check `shutdown` between phases and stop early once it is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn runtime(&self) -> &R {
        self.orchestrator.runtime()
    }

    /// Execute one run to a terminal phase
    pub async fn run(&self) -> RunOutcome {
        let mut state = RunState::new(self.config.job.dry_run);
        info!(
            run_id = %state.run_id,
            dry_run = state.dry_run,
            "{}",
            Phase::Init.description()
        );

        let mut lock = None;
        let result = self.execute(&mut state, &mut lock).await;

        if state.services_stopped {
            self.restore_services(&mut state).await;
        }

        let error = result.err();
        match &error {
            None => {
                state.enter(Phase::Done);
                if let Some(artifact) = &state.artifact {
                    info!(
                        "Backup: {} ({}), took {}",
                        artifact.path.display(),
                        format_bytes(artifact.size),
                        format_duration(
                            (Local::now() - state.started_at).to_std().unwrap_or_default()
                        )
                    );
                }
            }
            Some(e) => {
                error!(kind = e.kind(), "{}", e);
                state.enter(Phase::Failed);
            }
        }

        // Released only after the terminal phase so no second run overlaps
        // the restoration
        drop(lock);
        RunOutcome { state, error }
    }

    fn checkpoint(&self) -> Result<(), RunError> {
        if self.shutdown.is_cancelled() {
            Err(RunError::Interrupted)
        } else {
            Ok(())
        }
    }

    async fn execute(
        &self,
        state: &mut RunState,
        lock: &mut Option<InstanceLock>,
    ) -> Result<(), RunError> {
        self.lock(state, lock)?;
        state.enter(Phase::Locked);
        self.checkpoint()?;

        self.preflight(state)?;
        self.checkpoint()?;

        self.rotate(state);
        state.enter(Phase::LogRotated);
        self.checkpoint()?;

        // From here on, services are owed a restart
        state.services_stopped = true;
        self.stop_services(state).await?;
        self.checkpoint()?;

        self.archive(state).await?;
        self.checkpoint()?;

        self.verify(state).await?;
        self.checkpoint()?;

        self.secure_artifact(state);
        Ok(())
    }

    fn lock(&self, state: &RunState, lock: &mut Option<InstanceLock>) -> Result<(), RunError> {
        let path = &self.config.job.lock_file;
        let result = if state.dry_run {
            InstanceLock::probe(path).map(|()| {
                info!("[dry-run] Would acquire lock {}", path.display());
            })
        } else {
            InstanceLock::acquire(path).map(|acquired| {
                *lock = Some(acquired);
            })
        };

        result.map_err(|e| match e {
            LockError::AlreadyRunning { pid, .. } => RunError::LockContention { pid },
            other => RunError::Lock(other.to_string()),
        })
    }

    fn preflight(&self, state: &mut RunState) -> Result<(), RunError> {
        let job = &self.config.job;

        let mut accessible = 0;
        for source in &job.sources {
            match std::fs::metadata(source) {
                Ok(_) => accessible += 1,
                Err(e) => {
                    state.warn(format!("source {} is not accessible: {}", source.display(), e))
                }
            }
        }
        if accessible == 0 {
            return Err(RunError::Preflight(
                "none of the configured sources is accessible".into(),
            ));
        }

        if !job.backup_dir.is_dir() {
            if state.dry_run {
                info!("[dry-run] Would create backup directory {}", job.backup_dir.display());
            } else {
                std::fs::create_dir_all(&job.backup_dir).map_err(|e| {
                    RunError::Preflight(format!(
                        "cannot create backup directory {}: {}",
                        job.backup_dir.display(),
                        e
                    ))
                })?;
            }
        }

        let preflight = &self.config.preflight;
        match space::disk_space(&job.backup_dir) {
            Ok(free) => {
                space::check_thresholds(
                    &free,
                    preflight.min_free_space_gb,
                    preflight.min_free_space_percent,
                )
                .map_err(|reason| {
                    RunError::Preflight(format!(
                        "not enough space for {}: {}",
                        job.backup_dir.display(),
                        reason
                    ))
                })?;
                info!(
                    "Free space on backup target: {} ({:.1}%)",
                    format_bytes(free.available),
                    free.available_percent()
                );
            }
            Err(e) => state.warn(format!("cannot determine free space: {}", e)),
        }

        Ok(())
    }

    /// Rotate backups down to make room for the new artifact, and logs
    fn rotate(&self, state: &mut RunState) {
        let job = &self.config.job;
        let retention_config = &self.config.retention;
        let pattern = artifact_pattern();
        let classes = [
            (&job.backup_dir, pattern.clone(), retention_config.backups.saturating_sub(1)),
            // Leftovers of an interrupted run; none are worth keeping
            (&job.backup_dir, format!("{}.partial", pattern), 0),
            (&job.log_dir, run_log_pattern(), retention_config.logs),
        ];

        for (dir, pattern, keep) in classes {
            if state.dry_run {
                match retention::plan(dir, &pattern, keep) {
                    Ok(plan) => {
                        for path in plan.remove {
                            info!("[dry-run] Would remove {}", path.display());
                        }
                    }
                    Err(e) => state.warn(format!("cannot list {}: {}", dir.display(), e)),
                }
            } else {
                let report = retention::rotate(dir, &pattern, keep);
                for warning in report.warnings {
                    state.warn(warning);
                }
            }
        }
    }

    async fn stop_services(&self, state: &mut RunState) -> Result<(), RunError> {
        let services = &self.config.services;
        let groups = self.config.stop_order();

        let warnings = if !services.enabled {
            info!("Service control disabled");
            Vec::new()
        } else if state.dry_run {
            for group in &groups {
                info!(group = %group.name, "[dry-run] Would stop service group");
            }
            Vec::new()
        } else {
            self.orchestrator.stop(&groups).await.warnings
        };

        state.enter(Phase::ServicesStopped);
        let had_warnings = !warnings.is_empty();
        for warning in warnings {
            state.warn(warning);
        }

        if had_warnings && services.strict_stop {
            return Err(RunError::ServiceStop(
                "services did not stop cleanly and strict_stop is set".into(),
            ));
        }
        Ok(())
    }

    fn archive_request(&self, state: &RunState) -> ArchiveRequest {
        let job = &self.config.job;
        let mut excludes = job.exclude.clone();
        // Never archive our own output
        excludes.push(job.backup_dir.clone());

        ArchiveRequest {
            sources: job.sources.clone(),
            excludes,
            destination: job.backup_dir.join(artifact_name(state.started_at)),
            level: self.config.archive.compression_level,
        }
    }

    async fn archive(&self, state: &mut RunState) -> Result<(), RunError> {
        let request = self.archive_request(state);

        if state.dry_run {
            let options = WalkOptions::with_excludes(&request.excludes);
            match summarize(&request.sources, &options) {
                Ok(summary) => info!(
                    "[dry-run] Would archive {} files in {} directories ({}) into {}",
                    summary.files,
                    summary.dirs,
                    format_bytes(summary.bytes),
                    request.destination.display()
                ),
                Err(e) => state.warn(format!("cannot scan sources: {}", e)),
            }
            state.enter(Phase::Archived);
            return Ok(());
        }

        let builder = ArchiveBuilder::new(self.pipeline.clone(), self.config.retry_policy())
            .with_shutdown(self.shutdown.clone());

        match builder.create(&request, &self.passphrase).await {
            Ok(outcome) => {
                state.archive_attempts = outcome.attempts;
                state.enter(Phase::Archived);

                let skipped = outcome.warnings();
                for line in skipped.iter().take(MAX_SKIP_WARNINGS) {
                    state.warn(format!("skipped {}", line));
                }
                if skipped.len() > MAX_SKIP_WARNINGS {
                    state.warn(format!(
                        "{} more entries skipped",
                        skipped.len() - MAX_SKIP_WARNINGS
                    ));
                }
                state.artifact = Some(outcome.artifact);
                Ok(())
            }
            Err(failure) => {
                state.archive_attempts = failure.attempts;
                if failure.interrupted {
                    return Err(RunError::Interrupted);
                }
                Err(RunError::ArchiveFatal {
                    attempts: failure.attempts,
                    last_error: failure.last_error,
                })
            }
        }
    }

    async fn verify(&self, state: &mut RunState) -> Result<(), RunError> {
        match &state.artifact {
            Some(artifact) => {
                Verifier::new(self.pipeline.clone())
                    .verify(artifact, &self.passphrase)
                    .await?;
            }
            None => info!("[dry-run] Would verify the archive"),
        }
        state.enter(Phase::Verified);
        Ok(())
    }

    fn secure_artifact(&self, state: &mut RunState) {
        let permissions = ArtifactPermissions {
            owner: self.config.permissions.owner.clone(),
            group: self.config.permissions.group.clone(),
            mode: self.config.permissions.mode,
        };

        let result = match &state.artifact {
            Some(artifact) => permissions
                .apply_to_path(&artifact.path)
                .map_err(|e| format!("cannot secure {}: {}", artifact.path.display(), e)),
            None => {
                info!("[dry-run] Would set artifact permissions {}", permissions.describe());
                Ok(())
            }
        };

        state.enter(Phase::PermissionsSet);
        if let Err(message) = result {
            state.warn(message);
        }
    }

    async fn restore_services(&self, state: &mut RunState) {
        let services = &self.config.services;
        let groups = self.config.start_order();

        let warnings = if !services.enabled {
            Vec::new()
        } else if services.leave_down {
            vec!["services left down as configured".to_string()]
        } else if state.dry_run {
            for group in &groups {
                info!(group = %group.name, "[dry-run] Would start service group");
            }
            Vec::new()
        } else {
            let report = self.orchestrator.start(&groups).await;
            state.services_restarted = true;
            report.warnings
        };

        state.enter(Phase::ServicesStarted);
        for warning in warnings {
            state.warn(warning);
        }
    }
}
