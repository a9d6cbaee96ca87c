//! Sink configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default rotation threshold: 10 MiB.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of rotated generations kept.
pub const DEFAULT_BACKUP_COUNT: u32 = 5;

/// Default time to wait for the advisory lock before applying
/// [`LockTimeoutPolicy`].
pub const DEFAULT_LOCK_TIMEOUT_SECS: f64 = 10.0;

/// Encodings accepted for `encoding`. Records are bytes already rendered by
/// the logging framework; this only guards against a config written for a
/// different text encoding.
const UTF8_NAMES: &[&str] = &["utf-8", "utf8"];

/// What to do with a record when the lock cannot be had in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockTimeoutPolicy {
    /// Write the record without the lock. A torn write is preferred over a
    /// lost one.
    #[default]
    WriteUnlocked,
    /// Drop the record.
    Drop,
}

/// How the log file is opened at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    #[default]
    Append,
    /// Start from an empty file. Ignored (treated as `Append`) when rotation
    /// is enabled, since truncating would wipe records other processes just
    /// wrote.
    Truncate,
}

/// Sink configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: f64,
    #[serde(default)]
    pub on_lock_timeout: LockTimeoutPolicy,
    #[serde(default)]
    pub mode: OpenMode,
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

fn default_backup_count() -> u32 {
    DEFAULT_BACKUP_COUNT
}

fn default_lock_timeout_secs() -> f64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

impl SinkConfig {
    /// Create a config for `path` with defaults.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: DEFAULT_MAX_BYTES,
            backup_count: DEFAULT_BACKUP_COUNT,
            encoding: None,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            on_lock_timeout: LockTimeoutPolicy::default(),
            mode: OpenMode::default(),
        }
    }

    /// Parse a config from JSON, e.g.
    /// `{"path": "/var/log/app.log", "max_bytes": 524288, "backup_count": 5}`.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Builder: set max_bytes (0 disables rotation).
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Builder: set backup_count (0 truncates instead of keeping backups).
    pub fn with_backup_count(mut self, backup_count: u32) -> Self {
        self.backup_count = backup_count;
        self
    }

    /// Builder: set encoding.
    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Builder: set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Builder: set the lock timeout policy.
    pub fn with_on_lock_timeout(mut self, policy: LockTimeoutPolicy) -> Self {
        self.on_lock_timeout = policy;
        self
    }

    /// Builder: set the open mode.
    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Check the config without touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        if self.path.file_name().is_none() {
            return Err(ConfigError::NoFileName(self.path.clone()));
        }
        if !self.lock_timeout_secs.is_finite() || self.lock_timeout_secs < 0.0 {
            return Err(ConfigError::InvalidLockTimeout(self.lock_timeout_secs));
        }
        if let Some(encoding) = &self.encoding {
            let normalized = encoding.trim().to_ascii_lowercase();
            if !UTF8_NAMES.contains(&normalized.as_str()) {
                return Err(ConfigError::UnsupportedEncoding(encoding.clone()));
            }
        }
        Ok(())
    }

    /// Lock timeout as a `Duration`. Call after `validate()`.
    pub fn lock_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.lock_timeout_secs).unwrap_or(Duration::ZERO)
    }

    /// The mode actually used: truncation only applies when rotation is off.
    pub fn effective_mode(&self) -> OpenMode {
        if self.max_bytes > 0 {
            OpenMode::Append
        } else {
            self.mode
        }
    }

    /// `path` made absolute against the current directory, so a later
    /// `chdir` cannot split writers across two files.
    pub fn absolute_path(&self) -> Result<PathBuf, ConfigError> {
        absolute(&self.path)
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path).map_err(|source| ConfigError::Resolve {
        path: path.to_path_buf(),
        source,
    })
}
