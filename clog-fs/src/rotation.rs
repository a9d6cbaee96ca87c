//! Size-based rotation for a log target.
//!
//! Provides:
//! - The rotation decision (`should_rotate`) and retention plan
//! - `BackupRotator`, which shifts `.1..N` and frees the primary path

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::filesystem::{Filesystem, FsError};
use crate::naming::{backup_path, rotating_path, LogTarget};

/// Decide whether a file of `current_size` bytes must be rotated.
///
/// A `max_bytes` of zero disables rotation.
pub fn should_rotate(current_size: u64, max_bytes: u64) -> bool {
    max_bytes > 0 && current_size >= max_bytes
}

/// Generations kept for `backup_count`, newest first: `1..=backup_count`.
/// Anything above `backup_count` is deleted on rotation.
pub fn retention_plan(backup_count: u32) -> Vec<u32> {
    (1..=backup_count).collect()
}

/// Errors from a rotation. In every case the active log file is left at, or
/// put back at, the primary path.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("cannot move {path} out of the way (file in use?): {source}")]
    PrimaryInUse {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("failed to shift {from} to {to}: {source}")]
    Shift {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("failed to remove {path}: {source}")]
    Evict {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("failed to truncate {path}: {source}")]
    Truncate {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("{cause}; restoring {temp} to the primary path also failed: {source}")]
    Restore {
        cause: Box<RotationError>,
        temp: PathBuf,
        #[source]
        source: FsError,
    },
}

/// What a rotation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The primary file became generation 1.
    Rotated,
    /// Backups are disabled; the primary file was truncated in place.
    Truncated,
    /// The primary file was already gone: another process rotated it first.
    AlreadyRotated,
}

/// Result of a rotation operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationResult {
    pub outcome: RotationOutcome,

    /// Number of existing generations moved up by one.
    pub shifted: usize,

    /// Paths of generations deleted to make room.
    pub evicted: Vec<PathBuf>,
}

impl RotationResult {
    fn new(outcome: RotationOutcome) -> Self {
        Self {
            outcome,
            shifted: 0,
            evicted: Vec::new(),
        }
    }
}

/// Performs the rename sequence of a rotation.
///
/// Callers must hold the target's advisory lock and must have closed their
/// own handle on the primary file.
pub struct BackupRotator<'a, F: Filesystem> {
    fs: &'a F,
}

impl<'a, F: Filesystem> BackupRotator<'a, F> {
    pub fn new(fs: &'a F) -> Self {
        Self { fs }
    }

    /// Rotate `target`.
    ///
    /// The primary file is first moved to a private temporary name. That is
    /// the rename that fails on platforms which refuse to rename a file
    /// another process holds open, and failing there leaves every file as it
    /// was. Existing generations are then shifted up in descending order
    /// (`N-1 -> N`, ..., `1 -> 2`) and the temporary file becomes `.1`.
    pub fn rotate(&self, target: &LogTarget) -> Result<RotationResult, RotationError> {
        let primary = target.primary_path();

        if target.backup_count() == 0 {
            return match self.fs.truncate(primary) {
                Ok(()) => Ok(RotationResult::new(RotationOutcome::Truncated)),
                Err(e) if e.is_not_found() => {
                    Ok(RotationResult::new(RotationOutcome::AlreadyRotated))
                }
                Err(source) => Err(RotationError::Truncate {
                    path: primary.to_path_buf(),
                    source,
                }),
            };
        }

        let temp = rotating_path(primary);
        match self.fs.rename(primary, &temp) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                return Ok(RotationResult::new(RotationOutcome::AlreadyRotated));
            }
            Err(source) => {
                return Err(RotationError::PrimaryInUse {
                    path: primary.to_path_buf(),
                    source,
                });
            }
        }

        let mut result = RotationResult::new(RotationOutcome::Rotated);
        if let Err(cause) = self.shift_generations(target, &temp, &mut result) {
            // Put the data back where writers will find it.
            return match self.fs.rename(&temp, primary) {
                Ok(()) => Err(cause),
                Err(source) => Err(RotationError::Restore {
                    cause: Box::new(cause),
                    temp,
                    source,
                }),
            };
        }

        Ok(result)
    }

    fn shift_generations(
        &self,
        target: &LogTarget,
        temp: &Path,
        result: &mut RotationResult,
    ) -> Result<(), RotationError> {
        let primary = target.primary_path();
        let plan = retention_plan(target.backup_count());

        // Generations left over from a larger backup count.
        let mut stale = target.backup_count() + 1;
        loop {
            let path = backup_path(primary, stale);
            if !self.fs.exists(&path) {
                break;
            }
            self.evict(&path, result)?;
            stale += 1;
        }

        // Descending, skipping the oldest kept generation: it has nowhere to
        // go and is overwritten by the one below it.
        for &generation in plan.iter().rev().skip(1) {
            let from = backup_path(primary, generation);
            if !self.fs.exists(&from) {
                continue;
            }
            let to = backup_path(primary, generation + 1);
            self.evict(&to, result)?;
            match self.fs.rename(&from, &to) {
                Ok(()) => result.shifted += 1,
                // Removed by someone else between exists() and rename().
                Err(e) if e.is_not_found() => {}
                Err(source) => return Err(RotationError::Shift { from, to, source }),
            }
        }

        let first = backup_path(primary, 1);
        self.evict(&first, result)?;
        self.fs
            .rename(temp, &first)
            .map_err(|source| RotationError::Shift {
                from: temp.to_path_buf(),
                to: first,
                source,
            })
    }

    /// Remove `path` if it exists, recording it as evicted.
    fn evict(&self, path: &Path, result: &mut RotationResult) -> Result<(), RotationError> {
        match self.fs.remove(path) {
            Ok(()) => {
                result.evicted.push(path.to_path_buf());
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(RotationError::Evict {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
