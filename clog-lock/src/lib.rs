//! Cross-process advisory lock for the log sink.
//!
//! Provides an exclusive lock held on a dedicated lock file (`flock` on Unix,
//! `LockFileEx` on Windows, through `fs2`). Only cooperating writers that take
//! the same lock are excluded. The log file itself is never locked, so it can
//! be renamed while some process still holds the lock file open.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;

/// First delay between attempts while the lock is contended.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// Upper bound on the delay between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// True if the lock was merely busy for the whole timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}

/// Advisory exclusive lock keyed by a lock file path.
///
/// The lock file is opened lazily (creating it and its directory if needed)
/// and kept open between acquisitions. It is never deleted: only the OS lock
/// on it carries meaning.
#[derive(Debug)]
pub struct AdvisoryFileLock {
    path: PathBuf,
    file: Option<File>,
    held: bool,
}

impl AdvisoryFileLock {
    /// Create a lock for `path` without touching the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            held: false,
        }
    }

    /// Create a lock for `path` and open the lock file now, so a path that
    /// cannot be created is reported up front.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let mut lock = Self::new(path);
        lock.lock_file()?;
        Ok(lock)
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this instance currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Make a single, non-blocking attempt. Returns `Ok(false)` if another
    /// holder has it.
    pub fn try_acquire(&mut self) -> Result<bool, LockError> {
        if self.held {
            return Ok(true);
        }
        let file = self.lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                self.held = true;
                Ok(true)
            }
            Err(e) if is_contended(&e) => Ok(false),
            Err(source) => Err(LockError::Lock {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Block until the lock is held or `timeout` elapses.
    ///
    /// Polls with exponential backoff from [`INITIAL_BACKOFF`] up to
    /// [`MAX_BACKOFF`], never sleeping past the deadline. A zero timeout makes
    /// exactly one attempt. The returned guard releases the lock when dropped.
    pub fn acquire(&mut self, timeout: Duration) -> Result<LockGuard<'_>, LockError> {
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.try_acquire()? {
                return Ok(LockGuard { lock: self });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                });
            }

            thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Release the lock. Does nothing if it is not held; never fails.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Some(file) = &self.file {
            // Closing the file releases the lock as well, which close() does.
            let _ = FileExt::unlock(file);
        }
    }

    /// Release the lock and close the lock file. The next acquisition
    /// reopens it.
    pub fn close(&mut self) {
        self.release();
        self.file = None;
    }

    fn lock_file(&mut self) -> Result<&File, LockError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => open_lock_file(&self.path)?,
        };
        Ok(self.file.insert(file))
    }
}

impl Drop for AdvisoryFileLock {
    fn drop(&mut self) {
        self.close();
    }
}

/// Holds an [`AdvisoryFileLock`] until dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a mut AdvisoryFileLock,
}

impl LockGuard<'_> {
    /// Path of the held lock file.
    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    let open_err = |source| LockError::Open {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
    }

    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(open_err)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
