//! Size-rotating log sink that any number of processes may share.
//!
//! Each process opens a [`ConcurrentRotatingSink`] on the same path. Records
//! are serialised through an advisory lock on a sibling `.lock` file, and
//! whichever process pushes the file over `max_bytes` rotates it:
//!
//! ```text
//! app.log -> app.log.1 -> app.log.2 -> ... -> app.log.N (deleted)
//! ```
//!
//! Writers that still hold the old file notice the rotation on their next
//! record and reopen. Failures inside `emit()` are reported to a
//! [`Logger`] and never reach the application.

pub mod config;
pub mod error;
pub mod logger;
pub mod make_writer;
pub mod sink;

pub use clog_fs::{Filesystem, LogTarget, MockFilesystem, RealFilesystem};
pub use config::{
    LockTimeoutPolicy, OpenMode, SinkConfig, DEFAULT_BACKUP_COUNT, DEFAULT_LOCK_TIMEOUT_SECS,
    DEFAULT_MAX_BYTES,
};
pub use error::{ConfigError, SinkError};
pub use logger::{Level, LogEntry, Logger, MockLogger, NullLogger, StderrLogger};
pub use sink::{ConcurrentRotatingSink, EmitReport, RotationStatus};
