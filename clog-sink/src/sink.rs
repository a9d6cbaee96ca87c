//! The concurrent rotating sink.
//!
//! Every `emit()` runs the same critical section under the target's advisory
//! lock:
//!
//! ```text
//! acquire lock -> reopen if a peer rotated -> write + flush
//!     -> stat path -> rotate if over max_bytes -> release lock
//! ```
//!
//! The lock serialises processes; a process-local mutex serialises threads of
//! one process, since advisory locks do not reliably exclude one holder from
//! itself.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use clog_fs::{
    should_rotate, BackupRotator, Filesystem, LogHandle, LogTarget, RealFilesystem,
    RotationOutcome,
};
use clog_lock::AdvisoryFileLock;

use crate::config::{LockTimeoutPolicy, OpenMode, SinkConfig};
use crate::error::SinkError;
use crate::logger::{Logger, StderrLogger};

/// What happened to the size-based rotation during one emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStatus {
    /// The file is below the threshold (or rotation is disabled).
    NotNeeded,
    /// This call rotated the file.
    Rotated,
    /// Backups are disabled; this call truncated the file.
    Truncated,
    /// Another process had already moved the file away.
    AlreadyRotated,
    /// Rotation failed; the record is in the primary file and the next emit
    /// retries.
    Failed,
    /// The record was written without the lock, so the size check was left
    /// to the next emit that holds it.
    Deferred,
}

/// Outcome of a successful [`ConcurrentRotatingSink::try_emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitReport {
    /// False if the record was written without the lock after a timeout.
    pub locked: bool,
    /// True if the open handle was stale (a peer rotated) and was reopened.
    pub reopened: bool,
    pub rotation: RotationStatus,
}

/// Append-mode handle and how much this process wrote through it.
struct OpenStream<H> {
    handle: H,
    written: u64,
}

impl<H: LogHandle> OpenStream<H> {
    fn new(handle: H) -> Self {
        Self { handle, written: 0 }
    }

    fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.handle.write_all(record)?;
        self.handle.flush()?;
        self.written += record.len() as u64;
        Ok(())
    }
}

struct SinkState<H> {
    stream: Option<OpenStream<H>>,
    lock: AdvisoryFileLock,
    degraded: bool,
    closed: bool,
}

/// A size-rotating log sink that any number of processes may share.
///
/// Each process opens its own sink on the same path. Records are appended
/// whole, each exactly once, across the primary file and its backups.
pub struct ConcurrentRotatingSink<F: Filesystem = RealFilesystem> {
    fs: F,
    target: LogTarget,
    lock_timeout: Duration,
    on_lock_timeout: LockTimeoutPolicy,
    logger: Arc<dyn Logger>,
    state: Mutex<SinkState<F::Handle>>,
}

impl ConcurrentRotatingSink<RealFilesystem> {
    /// Open a sink on the real filesystem, reporting to stderr.
    pub fn open(config: SinkConfig) -> Result<Self, SinkError> {
        Self::open_with(RealFilesystem, config, Arc::new(StderrLogger::default()))
    }
}

impl<F: Filesystem> ConcurrentRotatingSink<F> {
    /// Open a sink with an explicit filesystem and diagnostic logger.
    ///
    /// Fails only on unusable configuration: invalid settings, a log or lock
    /// path that cannot be created or opened.
    pub fn open_with(
        fs: F,
        config: SinkConfig,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, SinkError> {
        config.validate()?;
        let path = config.absolute_path()?;
        let target = LogTarget::new(path, config.max_bytes, config.backup_count);

        if let Some(parent) = target.primary_path().parent() {
            fs.create_dir_all(parent).map_err(|source| SinkError::Open {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock = AdvisoryFileLock::open(target.lock_path()).map_err(|source| {
            SinkError::LockFile {
                path: target.lock_path().to_path_buf(),
                source,
            }
        })?;

        if config.mode == OpenMode::Truncate && config.effective_mode() == OpenMode::Append {
            logger.debug("truncate mode ignored: rotation is enabled");
        }
        let opened = match config.effective_mode() {
            OpenMode::Append => fs.open_append(target.primary_path()),
            OpenMode::Truncate => fs.open_truncate(target.primary_path()),
        };
        let stream = opened
            .map(OpenStream::new)
            .map_err(|source| SinkError::Open {
                path: target.primary_path().to_path_buf(),
                source,
            })?;

        Ok(Self {
            fs,
            target,
            lock_timeout: config.lock_timeout(),
            on_lock_timeout: config.on_lock_timeout,
            logger,
            state: Mutex::new(SinkState {
                stream: Some(stream),
                lock,
                degraded: false,
                closed: false,
            }),
        })
    }

    /// The target this sink writes to.
    pub fn target(&self) -> &LogTarget {
        &self.target
    }

    /// Append one rendered record. Never fails and never panics: a record
    /// that cannot be written is reported to the diagnostic logger and
    /// dropped.
    pub fn emit(&self, record: &[u8]) {
        if let Err(err) = self.try_emit(record) {
            self.logger.error(&format!(
                "dropped {} byte record for {}: {err}",
                record.len(),
                self.target.primary_path().display()
            ));
        }
    }

    /// Append one rendered record and report what happened. `Err` means the
    /// record was not written.
    pub fn try_emit(&self, record: &[u8]) -> Result<EmitReport, SinkError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(SinkError::Closed);
        }
        let SinkState {
            stream,
            lock,
            degraded,
            ..
        } = &mut *state;

        // Released on every return below, including errors.
        let guard = match lock.acquire(self.lock_timeout) {
            Ok(guard) => Some(guard),
            Err(err) => {
                let err = SinkError::from(err);
                match self.on_lock_timeout {
                    LockTimeoutPolicy::Drop => return Err(err),
                    LockTimeoutPolicy::WriteUnlocked => {
                        self.logger.warn(&format!("{err}; writing without it"));
                        None
                    }
                }
            }
        };

        let (mut open, reopened) = self.current_stream(stream.take())?;
        if let Err(source) = open.write_record(record) {
            // The handle is dropped; the next emit reopens.
            return Err(SinkError::WriteFailed {
                path: self.target.primary_path().to_path_buf(),
                source: source.into(),
            });
        }

        let (next, rotation) = if guard.is_some() {
            self.rotate_if_needed(open, degraded)
        } else {
            // Only the lock holder may rename files.
            self.logger
                .debug("rotation check deferred until the lock is next held");
            (Some(open), RotationStatus::Deferred)
        };
        // In degraded mode keep nothing open between records, so a peer whose
        // platform cannot rename open files gets a chance to rotate.
        *stream = if *degraded { None } else { next };

        let locked = guard.is_some();
        drop(guard);
        Ok(EmitReport {
            locked,
            reopened,
            rotation,
        })
    }

    /// Flush and close the log file and the lock file. Idempotent; later
    /// emits are dropped with [`SinkError::Closed`].
    pub fn close(&self) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(mut open) = state.stream.take() {
            if let Err(e) = open.handle.flush() {
                self.logger.error(&format!(
                    "flush of {} on close failed: {e}",
                    self.target.primary_path().display()
                ));
            }
        }
        state.lock.close();
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Whether the last rotation attempt failed and writes are going to an
    /// over-size primary file.
    pub fn is_degraded(&self) -> bool {
        self.lock_state().degraded
    }

    fn lock_state(&self) -> MutexGuard<'_, SinkState<F::Handle>> {
        // A panic in another emitting thread must not disable logging.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a stream on the file currently at the primary path, reopening
    /// if `slot` is missing or refers to a file a peer has rotated away.
    fn current_stream(
        &self,
        slot: Option<OpenStream<F::Handle>>,
    ) -> Result<(OpenStream<F::Handle>, bool), SinkError> {
        let primary = self.target.primary_path();
        match slot {
            Some(open) if self.is_current(&open) => Ok((open, false)),
            Some(stale) => {
                self.logger.debug(&format!(
                    "{} was rotated by another process after {} bytes from here; reopening",
                    primary.display(),
                    stale.written
                ));
                drop(stale);
                Ok((self.open_stream(primary)?, true))
            }
            None => Ok((self.open_stream(primary)?, false)),
        }
    }

    fn is_current(&self, open: &OpenStream<F::Handle>) -> bool {
        // Gone or unreadable counts as stale: a fresh open recreates it.
        self.fs
            .is_same_file(&open.handle, self.target.primary_path())
            .unwrap_or(false)
    }

    fn open_stream(&self, path: &Path) -> Result<OpenStream<F::Handle>, SinkError> {
        self.fs
            .open_append(path)
            .map(OpenStream::new)
            .map_err(|source| SinkError::WriteFailed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Rotate if the file at the primary path is over the threshold. Always
    /// hands back a stream on the current primary file unless reopening it
    /// failed or the sink is degraded.
    fn rotate_if_needed(
        &self,
        open: OpenStream<F::Handle>,
        degraded: &mut bool,
    ) -> (Option<OpenStream<F::Handle>>, RotationStatus) {
        let primary = self.target.primary_path();

        // Stat the path, not the handle: other processes write to it too.
        let size = match self.fs.stat(primary) {
            Ok(Some(stat)) => stat.len,
            Ok(None) => return (Some(open), RotationStatus::NotNeeded),
            Err(e) => {
                self.logger
                    .warn(&format!("cannot stat {}: {e}", primary.display()));
                return (Some(open), RotationStatus::NotNeeded);
            }
        };
        if !should_rotate(size, self.target.max_bytes()) {
            // A peer rotated the over-size file for us.
            self.leave_degraded(degraded);
            return (Some(open), RotationStatus::NotNeeded);
        }

        // Our own handle must be closed or the rename fails on some platforms.
        drop(open);

        let status = match BackupRotator::new(&self.fs).rotate(&self.target) {
            Ok(result) => {
                self.leave_degraded(degraded);
                self.logger.debug(&format!(
                    "rotated {} at {size} bytes ({:?}, {} shifted, {} evicted)",
                    primary.display(),
                    result.outcome,
                    result.shifted,
                    result.evicted.len()
                ));
                match result.outcome {
                    RotationOutcome::Rotated => RotationStatus::Rotated,
                    RotationOutcome::Truncated => RotationStatus::Truncated,
                    RotationOutcome::AlreadyRotated => RotationStatus::AlreadyRotated,
                }
            }
            Err(err) => {
                let err = SinkError::from(err);
                if *degraded {
                    self.logger.debug(&format!("still degraded: {err}"));
                } else {
                    *degraded = true;
                    self.logger.error(&format!(
                        "{err}; continuing to write to {} until a rotation succeeds",
                        primary.display()
                    ));
                }
                RotationStatus::Failed
            }
        };

        if *degraded {
            return (None, status);
        }
        match self.open_stream(primary) {
            Ok(fresh) => (Some(fresh), status),
            Err(err) => {
                self.logger.error(&format!("{err}; will retry on the next record"));
                (None, status)
            }
        }
    }

    fn leave_degraded(&self, degraded: &mut bool) {
        if *degraded {
            *degraded = false;
            self.logger.warn(&format!(
                "{} is back under {} bytes; rotation recovered",
                self.target.primary_path().display(),
                self.target.max_bytes()
            ));
        }
    }
}

impl<F: Filesystem> Drop for ConcurrentRotatingSink<F> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<F: Filesystem> std::fmt::Debug for ConcurrentRotatingSink<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentRotatingSink")
            .field("target", &self.target)
            .field("lock_timeout", &self.lock_timeout)
            .field("on_lock_timeout", &self.on_lock_timeout)
            .finish_non_exhaustive()
    }
}
