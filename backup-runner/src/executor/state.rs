//! Run phases and the mutable state of a single run.

use crate::archive::ArchiveArtifact;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Locked,
    LogRotated,
    ServicesStopped,
    Archived,
    Verified,
    PermissionsSet,
    ServicesStarted,
    Done,
    Failed,
}

impl Phase {
    /// Plain-language description used in the log
    pub fn description(self) -> &'static str {
        match self {
            Phase::Init => "Starting backup run",
            Phase::Locked => "Acquired the single-instance lock",
            Phase::LogRotated => "Rotated old backups and logs",
            Phase::ServicesStopped => "Stopped services for a consistent snapshot",
            Phase::Archived => "Created the encrypted archive",
            Phase::Verified => "Verified archive integrity",
            Phase::PermissionsSet => "Secured archive ownership and permissions",
            Phase::ServicesStarted => "Restored services",
            Phase::Done => "Backup completed successfully",
            Phase::Failed => "Backup failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::Locked => "LOCKED",
            Phase::LogRotated => "LOG_ROTATED",
            Phase::ServicesStopped => "SERVICES_STOPPED",
            Phase::Archived => "ARCHIVED",
            Phase::Verified => "VERIFIED",
            Phase::PermissionsSet => "PERMISSIONS_SET",
            Phase::ServicesStarted => "SERVICES_STARTED",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Everything a run learns while it executes. Owned by the controller and
/// handed to each phase by `&mut`.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: Uuid,
    pub phase: Phase,
    pub history: Vec<Phase>,
    pub started_at: DateTime<Local>,
    pub artifact: Option<ArchiveArtifact>,
    pub archive_attempts: u32,
    pub warnings: Vec<String>,
    /// The services phase began; restoration is owed from here on
    pub services_stopped: bool,
    pub services_restarted: bool,
    pub dry_run: bool,
}

impl RunState {
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            phase: Phase::Init,
            history: vec![Phase::Init],
            started_at: Local::now(),
            artifact: None,
            archive_attempts: 0,
            warnings: Vec::new(),
            services_stopped: false,
            services_restarted: false,
            dry_run,
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.history.push(phase);
        info!(phase = %phase, "{}", phase.description());
    }

    /// Record a non-fatal problem against the current phase
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(phase = %self.phase, "{}", message);
        self.warnings.push(format!("[{}] {}", self.phase, message));
    }
}
