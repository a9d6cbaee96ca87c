//! Error types for the sink.

use std::path::PathBuf;

use clog_fs::{FsError, RotationError};
use clog_lock::LockError;

/// Invalid sink configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("log path is empty")]
    EmptyPath,

    #[error("log path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error("cannot resolve log path {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock timeout must be a non-negative number of seconds, got {0}")]
    InvalidLockTimeout(f64),

    #[error("unsupported encoding {0:?} (records are written as UTF-8)")]
    UnsupportedEncoding(String),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the sink.
///
/// Construction returns the configuration-class variants (see
/// [`SinkError::is_configuration`]); everything else is reported by `emit()`
/// through the diagnostic logger and otherwise swallowed.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("cannot use lock file {path}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: LockError,
    },

    #[error("lock not acquired: {0}")]
    LockTimeout(#[source] LockError),

    #[error("lock unavailable: {0}")]
    Lock(#[source] LockError),

    #[error("rotation failed: {0}")]
    RotationFailed(#[from] RotationError),

    #[error("write to {path} failed: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("sink is closed")]
    Closed,
}

impl From<LockError> for SinkError {
    fn from(err: LockError) -> Self {
        if err.is_timeout() {
            SinkError::LockTimeout(err)
        } else {
            SinkError::Lock(err)
        }
    }
}

impl SinkError {
    /// True for errors raised while building the sink, which callers must
    /// handle; the rest are runtime conditions `emit()` absorbs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SinkError::Configuration(_) | SinkError::Open { .. } | SinkError::LockFile { .. }
        )
    }
}
