//! Single-instance lock file.
//!
//! Exclusion comes from an advisory `flock` held on the lock file for the
//! whole run. The kernel drops it when the holder exits, however it exits,
//! so a lock file left behind by a crashed run is simply reused. The PID
//! written into the file only serves diagnostics.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Attempts when the file is replaced between opening and locking it
const MAX_OPEN_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock {path} is held{}", held_by(.pid))]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },

    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn held_by(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" by pid {}", pid),
        None => String::new(),
    }
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn held(path: &Path) -> Self {
        LockError::AlreadyRunning {
            path: path.to_path_buf(),
            pid: recorded_pid(path),
        }
    }
}

/// PID written by the current holder, if readable
fn recorded_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether `file` is still the inode at `path`. A holder removes the file
/// on release, so a handle opened just before that points at a dead inode.
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Try to take the kernel lock on an open handle. `Ok(None)` means another
/// process holds it.
fn try_flock(file: File, path: &Path) -> Result<Option<Flock<File>>, LockError> {
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(locked) => Ok(Some(locked)),
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
        Err((_, errno)) => Err(LockError::io(path, io::Error::from(errno))),
    }
}

/// Exclusive claim on a lock file, released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: Option<Flock<File>>,
}

impl InstanceLock {
    /// Take the lock. Fails if another live process holds it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let pid = std::process::id();

        for _ in 0..MAX_OPEN_ATTEMPTS {
            let file = open_lock_file(path).map_err(|e| LockError::io(path, e))?;
            let Some(mut locked) = try_flock(file, path)? else {
                return Err(LockError::held(path));
            };

            if !still_linked(&locked, path).map_err(|e| LockError::io(path, e))? {
                debug!("Lock {} was replaced while locking, retrying", path.display());
                continue;
            }

            if let Some(previous) = recorded_pid(path) {
                warn!(previous, "Reusing lock {} left by an exited run", path.display());
            }
            locked
                .set_len(0)
                .and_then(|_| writeln!(locked, "{}", pid))
                .and_then(|_| locked.sync_all())
                .map_err(|e| LockError::io(path, e))?;

            info!(pid, "Acquired lock {}", path.display());
            return Ok(Self {
                path: path.to_path_buf(),
                file: Some(locked),
            });
        }

        Err(LockError::held(path))
    }

    /// Report whether the lock is free without creating or changing anything
    pub fn probe(path: &Path) -> Result<(), LockError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LockError::io(path, e)),
        };

        match try_flock(file, path)? {
            // Dropping the handle unlocks it again
            Some(_) => {
                debug!("Lock {} is free", path.display());
                Ok(())
            }
            None => Err(LockError::held(path)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file and drop the kernel lock. Safe to call more
    /// than once.
    pub fn release(&mut self) {
        let Some(locked) = self.file.take() else {
            return;
        };

        // Unlink while still locked so no contender can lock the old inode
        // and still find it at the path
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Released lock {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Lock {} already gone", self.path.display())
            }
            Err(e) => warn!("Failed to remove lock {}: {}", self.path.display(), e),
        }
        drop(locked);
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    /// PID of a process that has exited and been reaped
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_acquire_writes_pid_and_release_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        let mut lock = InstanceLock::acquire(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        lock.release();
        assert!(!path.exists());
        // Idempotent
        lock.release();
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        let _held = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        match err {
            LockError::AlreadyRunning { pid, .. } => assert_eq!(pid, Some(std::process::id())),
            other => panic!("unexpected error: {other}"),
        }
        assert!(InstanceLock::probe(&path).is_err());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        {
            let _lock = InstanceLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_leftover_lock_file_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, format!("{}\n", dead_pid())).unwrap();

        assert!(InstanceLock::probe(&path).is_ok());
        let _lock = InstanceLock::acquire(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_unreadable_leftover_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "not a pid").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { .. }));
    }

    #[test]
    fn test_racing_takeover_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, format!("{}\n", dead_pid())).unwrap();

        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));
        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    InstanceLock::acquire(&path)
                })
            })
            .collect();

        // Winners stay alive in `results` until every contender has tried
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LockError::AlreadyRunning { .. })));
    }

    #[test]
    fn test_probe_does_not_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("none.lock");
        assert!(InstanceLock::probe(&path).is_ok());
        assert!(!path.exists());
    }

    #[test]
    fn test_free_check_leaves_no_lock_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "").unwrap();

        InstanceLock::probe(&path).unwrap();
        InstanceLock::acquire(&path).unwrap();
    }
}
