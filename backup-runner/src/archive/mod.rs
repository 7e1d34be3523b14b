//! Archive pipeline: collect, compress, encrypt, and the inverse used for
//! verification.
//!
//! Each stage is a capability trait so the run controller can be exercised
//! with fakes. Stages are chained as `Write` adapters on the way out and
//! `Read` adapters on the way back, so data flows through every stage as it
//! is produced and no stage ever holds a complete archive.

pub mod builder;
pub mod compression;
pub mod tarball;
pub mod verifier;

use crate::crypto::{AesGcmEncryptor, Passphrase};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use builder::{
    ArchiveBuilder, ArchiveFailure, ArchiveOutcome, ArchiveRequest, Backoff, RetryPolicy,
};
pub use verifier::{VerificationFailure, VerificationReport, Verifier};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid archive format: {0}")]
    Format(String),

    #[error("No readable entries under the configured sources")]
    Empty,

    #[error("Source error: {0}")]
    Source(String),

    #[error("Archive task failed: {0}")]
    Task(String),
}

/// A writer that must be explicitly finished.
///
/// Finishing flushes trailing frames (compression epilogue, final
/// authenticated chunk) and then finishes the wrapped writer, down to the
/// file sink which syncs to disk. Dropping without finishing leaves the
/// output incomplete.
pub trait SealedWrite: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Terminal stage writing to the artifact file.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl SealedWrite for FileSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

/// Summary of a successful pack.
#[derive(Debug, Clone, Default)]
pub struct PackReport {
    /// Entries written (files, directories, symlinks)
    pub entries: u64,

    /// Payload bytes read from regular files
    pub bytes: u64,

    /// Entries left out, one human-readable line each
    pub skipped: Vec<String>,
}

/// Summary of a listing pass over an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListReport {
    pub entries: u64,
    pub bytes: u64,
}

/// Collects source trees into a single stream.
pub trait Archiver: Send + Sync {
    fn pack(
        &self,
        sources: &[PathBuf],
        excludes: &[PathBuf],
        sink: Box<dyn SealedWrite>,
    ) -> Result<PackReport, ArchiveError>;

    /// Walk every entry of an archive stream without extracting anything
    fn list(&self, source: Box<dyn Read + Send>) -> Result<ListReport, ArchiveError>;
}

pub trait Compressor: Send + Sync {
    fn compress_to(
        &self,
        sink: Box<dyn SealedWrite>,
        level: i32,
    ) -> Result<Box<dyn SealedWrite>, ArchiveError>;

    fn decompress_from(
        &self,
        source: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>, ArchiveError>;
}

pub trait Encryptor: Send + Sync {
    fn encrypt_to(
        &self,
        sink: Box<dyn SealedWrite>,
        passphrase: &Passphrase,
    ) -> Result<Box<dyn SealedWrite>, ArchiveError>;

    fn decrypt_from(
        &self,
        source: Box<dyn Read + Send>,
        passphrase: &Passphrase,
    ) -> Result<Box<dyn Read + Send>, ArchiveError>;
}

/// The finished, encrypted backup file.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Local>,
}

impl ArchiveArtifact {
    /// Describe an artifact already on disk
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            created_at,
        })
    }
}

/// The three capabilities wired together.
#[derive(Clone)]
pub struct Pipeline {
    pub archiver: Arc<dyn Archiver>,
    pub compressor: Arc<dyn Compressor>,
    pub encryptor: Arc<dyn Encryptor>,
}

impl Pipeline {
    /// tar + zstd + AES-256-GCM
    pub fn standard() -> Self {
        Self {
            archiver: Arc::new(tarball::TarArchiver::new()),
            compressor: Arc::new(compression::ZstdCompressor),
            encryptor: Arc::new(AesGcmEncryptor::default()),
        }
    }

    /// Pack `sources` into `file`, compressed then encrypted
    pub fn write(
        &self,
        sources: &[PathBuf],
        excludes: &[PathBuf],
        file: File,
        level: i32,
        passphrase: &Passphrase,
    ) -> Result<PackReport, ArchiveError> {
        let sink: Box<dyn SealedWrite> = Box::new(FileSink::new(file));
        let encrypted = self.encryptor.encrypt_to(sink, passphrase)?;
        let compressed = self.compressor.compress_to(encrypted, level)?;
        self.archiver.pack(sources, excludes, compressed)
    }

    /// Decrypt, decompress and list `file`
    pub fn read(&self, file: File, passphrase: &Passphrase) -> Result<ListReport, ArchiveError> {
        let source: Box<dyn Read + Send> = Box::new(BufReader::new(file));
        let decrypted = self.encryptor.decrypt_from(source, passphrase)?;
        let decompressed = self.compressor.decompress_from(decrypted)?;
        self.archiver.list(decompressed)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory sink whose contents stay reachable after `finish`.

    use super::SealedWrite;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct SharedBuffer {
        data: Arc<Mutex<Vec<u8>>>,
        finished: Arc<Mutex<bool>>,
    }

    impl SharedBuffer {
        pub fn contents(&self) -> Vec<u8> {
            self.data.lock().unwrap().clone()
        }

        pub fn is_finished(&self) -> bool {
            *self.finished.lock().unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SealedWrite for SharedBuffer {
        fn finish(self: Box<Self>) -> io::Result<()> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }
    }
}
