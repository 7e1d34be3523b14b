//! Error taxonomy for a backup run.
//!
//! Each variant of [`RunError`] is fatal. Non-fatal conditions (service
//! control hiccups, rotation failures, skipped source entries) never become
//! errors; they are recorded as warnings on the run state instead.

use crate::archive::verifier::VerificationFailure;
use crate::config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Another backup run is already active{}", holder_suffix(.pid))]
    LockContention { pid: Option<u32> },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error("Service stop failed: {0}")]
    ServiceStop(String),

    #[error("Archive creation failed after {attempts} attempt(s): {last_error}")]
    ArchiveFatal { attempts: u32, last_error: String },

    #[error("Verification failed: {0}")]
    Verification(#[from] VerificationFailure),

    #[error("Run interrupted by signal")]
    Interrupted,
}

fn holder_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {})", pid),
        None => String::new(),
    }
}

impl RunError {
    /// Short machine-friendly kind, used in the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Config(_) => "config",
            RunError::LockContention { .. } => "lock_contention",
            RunError::Lock(_) => "lock",
            RunError::Preflight(_) => "preflight",
            RunError::ServiceStop(_) => "service_stop",
            RunError::ArchiveFatal { .. } => "archive",
            RunError::Verification(_) => "verification",
            RunError::Interrupted => "interrupted",
        }
    }
}
