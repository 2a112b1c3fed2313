//! Advisory file locks for process-level mutual exclusion.
//!
//! Locks are taken with `fs2` on a dedicated lock file. They conflict across
//! processes and across separately opened handles within one process, and are
//! released when the [`LockGuard`] is dropped (or the process dies).

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::{debug, info};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(500);
const PROGRESS_MESSAGE_THRESHOLD: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for lock on {path:?} ({description})")]
    Timeout { path: PathBuf, description: String },

    #[error("I/O error during {operation} on {path:?}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
        operation: &'static str,
    },
}

/// RAII guard for a held lock. Dropping it closes the file, which releases
/// the advisory lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released lock {:?}", self.path);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// Acquire an exclusive lock, retrying with exponential backoff until
/// `timeout` elapses.
pub fn acquire_exclusive(
    lock_path: &Path,
    timeout: Duration,
    description: &str,
) -> Result<LockGuard, LockError> {
    acquire_with_retry(lock_path, timeout, description, Mode::Exclusive)
}

/// Acquire a shared lock. Any number of shared holders may coexist; they
/// conflict only with exclusive holders.
pub fn acquire_shared(
    lock_path: &Path,
    timeout: Duration,
    description: &str,
) -> Result<LockGuard, LockError> {
    acquire_with_retry(lock_path, timeout, description, Mode::Shared)
}

/// Try once to take an exclusive lock. Returns `Ok(None)` if someone else
/// holds it.
pub fn try_exclusive(lock_path: &Path) -> Result<Option<LockGuard>, LockError> {
    let file = open_lock_file(lock_path)?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(LockGuard {
            file,
            path: lock_path.to_path_buf(),
        })),
        Err(e) if is_contended(&e) => Ok(None),
        Err(e) => Err(LockError::Io {
            source: e,
            path: lock_path.to_path_buf(),
            operation: "acquire lock",
        }),
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, LockError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(|e| LockError::Io {
            source: e,
            path: lock_path.to_path_buf(),
            operation: "create parent directories",
        })?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| LockError::Io {
            source: e,
            path: lock_path.to_path_buf(),
            operation: "open lock file",
        })
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn acquire_with_retry(
    lock_path: &Path,
    timeout: Duration,
    description: &str,
    mode: Mode,
) -> Result<LockGuard, LockError> {
    let file = open_lock_file(lock_path)?;
    let start = Instant::now();
    let mut retry_delay = INITIAL_RETRY_DELAY;
    let mut progress_shown = false;

    loop {
        let attempt = match mode {
            Mode::Shared => FileExt::try_lock_shared(&file),
            Mode::Exclusive => FileExt::try_lock_exclusive(&file),
        };

        match attempt {
            Ok(()) => {
                debug!("Acquired {:?} lock {:?} ({})", mode, lock_path, description);
                return Ok(LockGuard {
                    file,
                    path: lock_path.to_path_buf(),
                });
            }
            Err(e) if is_contended(&e) => {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return Err(LockError::Timeout {
                        path: lock_path.to_path_buf(),
                        description: description.to_string(),
                    });
                }

                if !progress_shown && elapsed >= PROGRESS_MESSAGE_THRESHOLD {
                    info!(
                        "Waiting for lock on {} ({})...",
                        lock_path.display(),
                        description
                    );
                    progress_shown = true;
                }

                thread::sleep(retry_delay);
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
            Err(e) => {
                return Err(LockError::Io {
                    source: e,
                    path: lock_path.to_path_buf(),
                    operation: "acquire lock",
                });
            }
        }
    }
}
