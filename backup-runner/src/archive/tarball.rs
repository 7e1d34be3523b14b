//! tar collection stage.

use super::{ArchiveError, Archiver, ListReport, PackReport, SealedWrite};
use crate::fs::walker::{is_tolerated, walk_sources, EntryKind, SourceEntry, WalkEvent, WalkOptions};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Packs source trees into a GNU tar stream.
///
/// Entry names are the source paths with the leading `/` removed, so an
/// archive extracted under a scratch directory mirrors the original layout.
#[derive(Debug, Clone, Default)]
pub struct TarArchiver {
    follow_links: bool,
}

impl TarArchiver {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Reader that counts the bytes it passed through.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

fn archive_name(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn skip(report: &mut PackReport, path: &Path, reason: impl std::fmt::Display) {
    warn!("Skipping {}: {}", path.display(), reason);
    report.skipped.push(format!("{}: {}", path.display(), reason));
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &SourceEntry,
    name: &Path,
    report: &mut PackReport,
) -> io::Result<()> {
    let file = match File::open(&entry.path) {
        Ok(file) => file,
        Err(e) if is_tolerated(e.kind()) => {
            skip(report, &entry.path, e);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // The header is built from the open handle so the size matches what is
    // read; a file that shrinks afterwards is padded to keep the tar valid
    let metadata = file.metadata()?;
    let len = metadata.len();
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, tar::HeaderMode::Complete);
    header.set_size(len);

    let mut counted = CountingReader {
        inner: file.take(len),
        count: 0,
    };
    builder.append_data(&mut header, name, (&mut counted).chain(io::repeat(0)).take(len))?;

    if counted.count < len {
        skip(
            report,
            &entry.path,
            format!("changed while reading ({} of {} bytes)", counted.count, len),
        );
    }
    report.entries += 1;
    report.bytes += len;
    Ok(())
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &SourceEntry,
    report: &mut PackReport,
) -> io::Result<()> {
    let name = archive_name(&entry.path);
    if name.as_os_str().is_empty() {
        return Ok(());
    }

    let result = match entry.kind {
        EntryKind::File => return append_file(builder, entry, &name, report),
        EntryKind::Dir => builder.append_dir(&name, &entry.path),
        EntryKind::Symlink => builder.append_path_with_name(&entry.path, &name),
        EntryKind::Special => {
            debug!("Not archiving special file {}", entry.path.display());
            return Ok(());
        }
    };

    match result {
        Ok(()) => {
            report.entries += 1;
            Ok(())
        }
        Err(e) if is_tolerated(e.kind()) => {
            skip(report, &entry.path, e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

impl Archiver for TarArchiver {
    fn pack(
        &self,
        sources: &[PathBuf],
        excludes: &[PathBuf],
        sink: Box<dyn SealedWrite>,
    ) -> Result<PackReport, ArchiveError> {
        let mut builder = tar::Builder::new(sink);
        builder.follow_symlinks(self.follow_links);
        builder.mode(tar::HeaderMode::Complete);

        let options = WalkOptions {
            follow_links: self.follow_links,
            excludes: excludes.to_vec(),
        };
        let mut report = PackReport::default();

        walk_sources(sources, &options, |event| match event {
            WalkEvent::Entry(entry) => append_entry(&mut builder, &entry, &mut report),
            WalkEvent::Skipped { path, reason } => {
                skip(&mut report, &path, reason);
                Ok(())
            }
        })?;

        if report.entries == 0 {
            return Err(ArchiveError::Empty);
        }

        let sink = builder.into_inner()?;
        sink.finish()?;
        Ok(report)
    }

    fn list(&self, mut source: Box<dyn Read + Send>) -> Result<ListReport, ArchiveError> {
        let mut report = ListReport::default();
        {
            let mut archive = tar::Archive::new(&mut source);
            for entry in archive.entries()? {
                let mut entry = entry?;
                report.bytes += io::copy(&mut entry, &mut io::sink())?;
                report.entries += 1;
            }
        }

        // Consume the trailer so every upstream frame and chunk is checked
        io::copy(&mut source, &mut io::sink())?;
        Ok(report)
    }
}
