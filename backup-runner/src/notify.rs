//! Run summary and the optional notification hook.
//!
//! The summary is printed as JSON on stdout after every run, so off-site
//! sync jobs and monitoring can pick up the outcome without parsing the log.
//! If `notify.command` is set, the same JSON is piped to that command.

use crate::archive::ArchiveArtifact;
use crate::config::NotifyConfig;
use crate::executor::{Phase, RunOutcome};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub kind: &'static str,
    pub message: String,
}

/// Machine-readable account of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub host: String,
    pub status: RunStatus,
    pub dry_run: bool,
    pub final_phase: Phase,
    pub phases: Vec<Phase>,
    pub started_at: DateTime<Local>,
    pub duration_secs: f64,
    pub artifact: Option<ArchiveArtifact>,
    pub archive_attempts: u32,
    pub services_restarted: bool,
    pub warnings: Vec<String>,
    pub error: Option<ErrorSummary>,
}

impl RunSummary {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        let state = &outcome.state;
        let host = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let duration = (Local::now() - state.started_at)
            .to_std()
            .unwrap_or_default();

        Self {
            run_id: state.run_id,
            host,
            status: if outcome.succeeded() {
                RunStatus::Success
            } else {
                RunStatus::Failure
            },
            dry_run: state.dry_run,
            final_phase: state.phase,
            phases: state.history.clone(),
            started_at: state.started_at,
            duration_secs: duration.as_secs_f64(),
            artifact: state.artifact.clone(),
            archive_attempts: state.archive_attempts,
            services_restarted: state.services_restarted,
            warnings: state.warnings.clone(),
            error: outcome.error.as_ref().map(|e| ErrorSummary {
                kind: e.kind(),
                message: e.to_string(),
            }),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("cannot serialize run summary: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cannot run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("notification I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("notification command timed out after {0:?}")]
    Timeout(Duration),

    #[error("notification command exited with {0}")]
    Status(ExitStatus),
}

/// Pipes the run summary to an external command.
#[derive(Debug, Clone)]
pub struct Notifier {
    command: Vec<String>,
    timeout: Duration,
}

impl Notifier {
    /// `None` when no hook is configured
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        let command = config.command.clone().filter(|c| !c.is_empty())?;
        Some(Self {
            command,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub async fn send(&self, summary: &RunSummary) -> Result<(), NotifyError> {
        let payload = summary.to_json()?;
        let (program, args) = match self.command.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        debug!("Running notification hook {}", program);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                program: program.clone(),
                source,
            })?;

        let exchange = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            child.wait().await
        };

        let status = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))??;
        if !status.success() {
            return Err(NotifyError::Status(status));
        }

        info!("Notification delivered via {}", program);
        Ok(())
    }
}
