//! Integrity check of a finished artifact.
//!
//! Runs the pipeline backwards (decrypt, decompress, list) over the whole
//! file. Every entry body is read and discarded, so each authenticated chunk
//! and the compression checksum are checked without extracting anything.

use super::{ArchiveArtifact, ArchiveError, Pipeline};
use crate::crypto::Passphrase;
use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum VerificationFailure {
    #[error("artifact {0} is missing")]
    Missing(PathBuf),

    #[error("artifact {0} is empty")]
    Empty(PathBuf),

    #[error("artifact {0} holds no entries")]
    NoEntries(PathBuf),

    #[error("artifact is unreadable: {0}")]
    Pipeline(#[from] ArchiveError),

    #[error("verification task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub entries: u64,
    pub bytes: u64,
    pub duration: Duration,
}

pub struct Verifier {
    pipeline: Pipeline,
}

impl Verifier {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub async fn verify(
        &self,
        artifact: &ArchiveArtifact,
        passphrase: &Passphrase,
    ) -> Result<VerificationReport, VerificationFailure> {
        let path = artifact.path.clone();
        let metadata = std::fs::metadata(&path)
            .map_err(|_| VerificationFailure::Missing(path.clone()))?;
        if metadata.len() == 0 {
            return Err(VerificationFailure::Empty(path));
        }

        info!("Verifying archive integrity: {}", path.display());
        let started = Instant::now();

        let pipeline = self.pipeline.clone();
        let passphrase = passphrase.clone();
        let read_path = path.clone();
        let listed = tokio::task::spawn_blocking(move || {
            let file = File::open(&read_path)?;
            pipeline.read(file, &passphrase)
        })
        .await
        .map_err(|e| VerificationFailure::Task(e.to_string()))??;

        if listed.entries == 0 {
            return Err(VerificationFailure::NoEntries(path));
        }

        let report = VerificationReport {
            entries: listed.entries,
            bytes: listed.bytes,
            duration: started.elapsed(),
        };
        info!(
            entries = report.entries,
            "Archive verified: {} entries, {} of content",
            report.entries,
            crate::utils::format::format_bytes(report.bytes)
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveBuilder, ArchiveRequest, RetryPolicy};
    use crate::crypto::{AesGcmEncryptor, KdfParams};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn pipeline() -> Pipeline {
        Pipeline {
            encryptor: Arc::new(AesGcmEncryptor::new(KdfParams::insecure_for_tests())),
            ..Pipeline::standard()
        }
    }

    async fn build_artifact(dir: &TempDir, passphrase: &Passphrase) -> ArchiveArtifact {
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("conf")).unwrap();
        fs::write(src.join("conf/app.yml"), b"port: 8080\n").unwrap();
        fs::write(src.join("db.sqlite"), vec![3u8; 150_000]).unwrap();

        let request = ArchiveRequest {
            sources: vec![src],
            excludes: Vec::new(),
            destination: dir.path().join("out.tar.zst.enc"),
            level: 3,
        };
        ArchiveBuilder::new(pipeline(), RetryPolicy::default())
            .create(&request, passphrase)
            .await
            .unwrap()
            .artifact
    }

    #[tokio::test]
    async fn test_verify_round_trip() {
        let dir = TempDir::new().unwrap();
        let passphrase = Passphrase::new("verify me");
        let artifact = build_artifact(&dir, &passphrase).await;

        let report = Verifier::new(pipeline())
            .verify(&artifact, &passphrase)
            .await
            .unwrap();
        // src, src/conf, src/conf/app.yml, src/db.sqlite
        assert_eq!(report.entries, 4);
        assert_eq!(report.bytes, 150_000 + 11);
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let passphrase = Passphrase::new("verify me");
        let artifact = build_artifact(&dir, &passphrase).await;

        let mut bytes = fs::read(&artifact.path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;
        fs::write(&artifact.path, bytes).unwrap();

        let result = Verifier::new(pipeline()).verify(&artifact, &passphrase).await;
        assert!(matches!(result, Err(VerificationFailure::Pipeline(_))));
        // The artifact is left in place for inspection
        assert!(artifact.path.exists());
    }

    #[tokio::test]
    async fn test_verify_rejects_damaged_key_parameters_promptly() {
        let dir = TempDir::new().unwrap();
        let passphrase = Passphrase::new("verify me");
        let artifact = build_artifact(&dir, &passphrase).await;

        let mut bytes = fs::read(&artifact.path).unwrap();
        for byte in &mut bytes[5..17] {
            *byte = 0xff;
        }
        fs::write(&artifact.path, bytes).unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            Verifier::new(pipeline()).verify(&artifact, &passphrase),
        )
        .await
        .expect("verification of a damaged header must not hang");
        assert!(matches!(
            result,
            Err(VerificationFailure::Pipeline(ArchiveError::Format(_)))
        ));
    }

    #[tokio::test]
    async fn test_verify_detects_truncation() {
        let dir = TempDir::new().unwrap();
        let passphrase = Passphrase::new("verify me");
        let artifact = build_artifact(&dir, &passphrase).await;

        let bytes = fs::read(&artifact.path).unwrap();
        fs::write(&artifact.path, &bytes[..bytes.len() - 10]).unwrap();

        let result = Verifier::new(pipeline()).verify(&artifact, &passphrase).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_verify_wrong_passphrase() {
        let dir = TempDir::new().unwrap();
        let artifact = build_artifact(&dir, &Passphrase::new("right")).await;

        let result = Verifier::new(pipeline())
            .verify(&artifact, &Passphrase::new("wrong"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_verify_missing_and_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nothing.enc");
        let artifact = ArchiveArtifact {
            path: path.clone(),
            size: 0,
            created_at: chrono::Local::now(),
        };
        let passphrase = Passphrase::new("x");

        let result = Verifier::new(pipeline()).verify(&artifact, &passphrase).await;
        assert!(matches!(result, Err(VerificationFailure::Missing(_))));

        fs::write(&path, b"").unwrap();
        let result = Verifier::new(pipeline()).verify(&artifact, &passphrase).await;
        assert!(matches!(result, Err(VerificationFailure::Empty(_))));
    }
}
