//! Rotation of backup artifacts and run logs.
//!
//! Files are ranked newest first by modification time (name as tie-break)
//! and everything past the first `keep` is deleted. Each artifact class is
//! rotated on its own; a failed deletion is a warning, never an error.

use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

/// Files a rotation would keep and remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationPlan {
    pub keep: Vec<PathBuf>,
    pub remove: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RotationReport {
    pub kept: usize,
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Match a file name against a pattern where `*` stands for any run of
/// characters (including none). No other characters are special.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    if !name.starts_with(first) {
        return false;
    }
    let mut rest = &name[first.len()..];

    let remaining: Vec<&str> = parts.collect();
    let Some((last, middle)) = remaining.split_last() else {
        // No wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Regular files in `dir` whose names match `pattern`, newest first.
pub fn matching_files(dir: &Path, pattern: &str) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| matches_pattern(&e.file_name().to_string_lossy(), pattern))
        .map(|e| {
            let modified = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();

    files.sort_by_key(|(modified, path)| (Reverse(*modified), Reverse(path.clone())));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Decide what a rotation would do, without touching anything
pub fn plan(dir: &Path, pattern: &str, keep: usize) -> io::Result<RotationPlan> {
    let mut files = matching_files(dir, pattern)?;
    let remove = if files.len() > keep {
        files.split_off(keep)
    } else {
        Vec::new()
    };
    Ok(RotationPlan { keep: files, remove })
}

/// Delete all but the `keep` newest files matching `pattern` in `dir`
pub fn rotate(dir: &Path, pattern: &str, keep: usize) -> RotationReport {
    let mut report = RotationReport::default();

    let plan = match plan(dir, pattern, keep) {
        Ok(plan) => plan,
        Err(e) => {
            let message = format!("cannot list {}: {}", dir.display(), e);
            warn!("Rotation skipped: {}", message);
            report.warnings.push(message);
            return report;
        }
    };
    report.kept = plan.keep.len();

    for old in plan.remove {
        match fs::remove_file(&old) {
            Ok(()) => {
                info!("Removed old file: {}", old.display());
                report.removed.push(old);
            }
            Err(e) => {
                let message = format!("cannot remove {}: {}", old.display(), e);
                warn!("Rotation warning: {}", message);
                report.warnings.push(message);
            }
        }
    }

    report
}
