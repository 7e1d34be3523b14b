//! Free disk space checks.

use nix::sys::statvfs::statvfs;
use std::path::{Path, PathBuf};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total: u64,
    pub available: u64,
}

impl DiskSpace {
    pub fn available_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.available as f64 * 100.0 / self.total as f64
    }
}

/// Closest ancestor of `path` that exists, so a backup directory that is
/// yet to be created is measured on the filesystem that will hold it.
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Space on the filesystem holding `path`
pub fn disk_space(path: &Path) -> std::io::Result<DiskSpace> {
    let stat = statvfs(&existing_ancestor(path)).map_err(std::io::Error::from)?;
    let fragment = stat.fragment_size() as u64;
    Ok(DiskSpace {
        total: (stat.blocks() as u64).saturating_mul(fragment),
        available: (stat.blocks_available() as u64).saturating_mul(fragment),
    })
}

/// Check `space` against both thresholds. A threshold of zero is disabled.
pub fn check_thresholds(space: &DiskSpace, min_gb: u64, min_percent: u8) -> Result<(), String> {
    let required = min_gb.saturating_mul(GIB);
    if space.available < required {
        return Err(format!(
            "only {} free, {} GiB required",
            crate::utils::format::format_bytes(space.available),
            min_gb
        ));
    }

    let percent = space.available_percent();
    if min_percent > 0 && percent < f64::from(min_percent) {
        return Err(format!(
            "only {:.1}% free, {}% required",
            percent, min_percent
        ));
    }

    Ok(())
}
