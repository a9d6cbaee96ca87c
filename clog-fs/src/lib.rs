//! Filesystem layer for the concurrent rotating log sink.
//!
//! This crate provides:
//! - Filesystem trait for the opens, stats and renames the sink performs
//! - LogTarget naming: backup generations and the derived lock file
//! - Rotation decision and the backup rotation sequence

pub mod filesystem;
pub mod naming;
pub mod rotation;

pub use filesystem::{
    FileStat, Filesystem, FsError, LogHandle, MockFilesystem, MockHandle, RealFilesystem,
    RealHandle,
};
pub use naming::{backup_path, lock_path_for, rotating_path, LogTarget};
pub use rotation::{
    retention_plan, should_rotate, BackupRotator, RotationError, RotationOutcome,
    RotationResult,
};
