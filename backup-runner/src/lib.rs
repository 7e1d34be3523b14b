//! Backup Runner Library
//!
//! Orchestrates one backup run: quiesce dependent services, stream the
//! configured paths through compression and encryption into a single
//! artifact, verify it, rotate old artifacts and logs, and bring the
//! services back up no matter how the run ends.

pub mod archive;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod notify;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::JobConfig;
pub use executor::{RunController, RunOutcome};
pub use utils::errors::RunError;
