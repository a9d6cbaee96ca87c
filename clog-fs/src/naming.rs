//! On-disk naming for a rotating log target.
//!
//! - `app.log`        active log
//! - `app.log.1..N`   rotated generations, `.1` newest
//! - `app.lock`       advisory lock file shared by every writer
//! - `app.log.rot.*`  short-lived name used while a rotation is in flight

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Suffix replaced when deriving the lock file name.
pub const LOG_SUFFIX: &str = ".log";

/// Suffix of the lock file.
pub const LOCK_SUFFIX: &str = ".lock";

/// Infix of the temporary name the primary file is moved to during rotation.
pub const ROTATING_INFIX: &str = ".rot.";

static ROTATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Immutable description of a rotating log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    primary_path: PathBuf,
    lock_path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
}

impl LogTarget {
    /// Create a target, deriving the lock path from `primary_path`.
    pub fn new(primary_path: PathBuf, max_bytes: u64, backup_count: u32) -> Self {
        let lock_path = lock_path_for(&primary_path);
        Self {
            primary_path,
            lock_path,
            max_bytes,
            backup_count,
        }
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn backup_count(&self) -> u32 {
        self.backup_count
    }

    /// Path of backup generation `generation` (1 = newest).
    pub fn backup_path(&self, generation: u32) -> PathBuf {
        backup_path(&self.primary_path, generation)
    }
}

/// Derive the lock file path for a log file.
///
/// Only a trailing `.log` on the file name is replaced; a name without one
/// gets `.lock` appended. `/var/log/app.log.source.log` locks on
/// `/var/log/app.log.source.lock`, never on anything derived from the inner
/// `.log`.
pub fn lock_path_for(primary: &Path) -> PathBuf {
    let Some(name) = primary.file_name() else {
        return with_suffix(primary, LOCK_SUFFIX);
    };

    let lock_name = match name.to_str().and_then(|n| n.strip_suffix(LOG_SUFFIX)) {
        Some(stem) => format!("{stem}{LOCK_SUFFIX}").into(),
        None => {
            let mut lock_name = name.to_os_string();
            lock_name.push(LOCK_SUFFIX);
            lock_name
        }
    };
    primary.with_file_name(lock_name)
}

/// Path of backup generation `generation` for `primary`: `primary.<generation>`.
pub fn backup_path(primary: &Path, generation: u32) -> PathBuf {
    with_suffix(primary, &format!(".{generation}"))
}

/// A temporary path, unique to this process and call, next to `primary`.
pub fn rotating_path(primary: &Path) -> PathBuf {
    let seq = ROTATION_SEQ.fetch_add(1, Ordering::Relaxed);
    with_suffix(
        primary,
        &format!("{ROTATING_INFIX}{}.{seq}", std::process::id()),
    )
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}
