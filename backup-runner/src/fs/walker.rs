//! Source tree traversal for archiving.
//!
//! Live systems change underneath a backup: files vanish between listing and
//! reading, and some directories are unreadable. Those entries are reported
//! as [`WalkEvent::Skipped`] instead of failing the walk.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Paths to leave out, together with everything below them
    pub excludes: Vec<PathBuf>,
}

impl WalkOptions {
    pub fn with_excludes(excludes: &[PathBuf]) -> Self {
        Self {
            follow_links: false,
            excludes: excludes.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    /// Sockets, FIFOs and device nodes
    Special,
}

/// An entry discovered during walking
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Full path to the entry
    pub path: PathBuf,

    pub kind: EntryKind,

    /// Size reported when the entry was listed
    pub size: u64,
}

#[derive(Debug, Clone)]
pub enum WalkEvent {
    Entry(SourceEntry),
    Skipped { path: PathBuf, reason: String },
}

/// Aggregate view of what a walk would archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    pub skipped: u64,
}

impl SourceEntry {
    fn from_entry(entry: &DirEntry) -> io::Result<Self> {
        let metadata = entry.metadata().map_err(io::Error::from)?;
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Special
        };

        Ok(Self {
            path: entry.path().to_path_buf(),
            kind,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
        })
    }
}

/// Errors that mean "this entry is gone or off limits", not "the walk is broken"
pub fn is_tolerated(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

/// Check if a path falls under one of the excluded paths
pub fn is_excluded(path: &Path, excludes: &[PathBuf]) -> bool {
    excludes.iter().any(|exclude| path.starts_with(exclude))
}

/// Walk every source tree, calling `callback` for each entry or skip.
///
/// Sources are visited in the order given; entries within a directory are
/// sorted by name so repeated runs produce the same archive order. An error
/// returned by the callback stops the walk.
pub fn walk_sources<F>(
    sources: &[PathBuf],
    options: &WalkOptions,
    mut callback: F,
) -> io::Result<()>
where
    F: FnMut(WalkEvent) -> io::Result<()>,
{
    for root in sources {
        if is_excluded(root, &options.excludes) {
            continue;
        }

        let walker = WalkDir::new(root)
            .follow_links(options.follow_links)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_excluded(entry.path(), &options.excludes));

        for entry in walker {
            let event = match entry {
                Ok(entry) => match SourceEntry::from_entry(&entry) {
                    Ok(source_entry) => WalkEvent::Entry(source_entry),
                    Err(e) if is_tolerated(e.kind()) => WalkEvent::Skipped {
                        path: entry.path().to_path_buf(),
                        reason: e.to_string(),
                    },
                    Err(e) => return Err(e),
                },
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    let tolerated = err.io_error().map(|e| is_tolerated(e.kind())).unwrap_or(false);
                    if !tolerated {
                        return Err(err.into());
                    }
                    WalkEvent::Skipped {
                        path,
                        reason: err.to_string(),
                    }
                }
            };
            callback(event)?;
        }
    }

    Ok(())
}

/// Count what a walk would archive, without reading file contents
pub fn summarize(sources: &[PathBuf], options: &WalkOptions) -> io::Result<WalkSummary> {
    let mut summary = WalkSummary::default();

    walk_sources(sources, options, |event| {
        match event {
            WalkEvent::Entry(entry) => match entry.kind {
                EntryKind::File => {
                    summary.files += 1;
                    summary.bytes += entry.size;
                }
                EntryKind::Dir => summary.dirs += 1,
                EntryKind::Symlink => summary.files += 1,
                EntryKind::Special => summary.skipped += 1,
            },
            WalkEvent::Skipped { .. } => summary.skipped += 1,
        }
        Ok(())
    })?;

    Ok(summary)
}
