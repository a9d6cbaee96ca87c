//! Diagnostic output for the sink itself.
//!
//! The sink never raises out of `emit()`, so every failure it swallows is
//! reported here instead. This must not route back into the sink, which is
//! why the default writes straight to stderr.

use std::io::Write;
use std::sync::{Arc, RwLock};

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// A record was dropped or rotation failed.
    Error,
    /// Degraded but no data lost (e.g. wrote without the lock).
    Warn,
    /// Protocol chatter: reopen after a peer rotation, rotation done.
    Debug,
}

impl Level {
    /// Lowercase label used as the stderr prefix.
    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Debug => "debug",
        }
    }
}

/// Trait for diagnostic output.
///
/// Implementations must be thread-safe: every thread calling `emit()` may
/// report through the same logger.
pub trait Logger: Send + Sync {
    /// Log a message at the given level.
    fn log(&self, level: Level, message: &str);

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
}

/// Logger that writes to stderr.
#[derive(Debug)]
pub struct StderrLogger {
    level: Level,
}

impl StderrLogger {
    /// Create a stderr logger showing messages up to `level`.
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Errors and warnings only.
    pub fn warnings() -> Self {
        Self::new(Level::Warn)
    }

    /// Everything, including protocol chatter.
    pub fn debug() -> Self {
        Self::new(Level::Debug)
    }
}

impl Default for StderrLogger {
    fn default() -> Self {
        Self::warnings()
    }
}

impl Logger for StderrLogger {
    fn log(&self, level: Level, message: &str) {
        if level <= self.level {
            let _ = writeln!(
                std::io::stderr(),
                "clog: {}: {} (pid={})",
                level.label(),
                message,
                std::process::id()
            );
        }
    }
}

/// Mock logger for testing that captures all messages.
#[derive(Debug, Clone, Default)]
pub struct MockLogger {
    messages: Arc<RwLock<Vec<LogEntry>>>,
}

/// A captured log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
}

impl MockLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all captured log entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.messages.read().unwrap().clone()
    }

    /// Get all captured messages (just the text).
    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.message).collect()
    }

    /// Get messages at a specific level.
    pub fn messages_at_level(&self, level: Level) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == level)
            .map(|e| e.message)
            .collect()
    }

    /// Check if any message contains the given substring.
    pub fn contains(&self, substring: &str) -> bool {
        self.messages().iter().any(|m| m.contains(substring))
    }

    /// Count messages containing the given substring.
    pub fn count_containing(&self, substring: &str) -> usize {
        self.messages().iter().filter(|m| m.contains(substring)).count()
    }

    /// Clear all captured messages.
    pub fn clear(&self) {
        self.messages.write().unwrap().clear();
    }

    /// Get count of captured messages.
    pub fn count(&self) -> usize {
        self.messages.read().unwrap().len()
    }
}

impl Logger for MockLogger {
    fn log(&self, level: Level, message: &str) {
        self.messages.write().unwrap().push(LogEntry {
            level,
            message: message.to_string(),
        });
    }
}

/// A no-op logger that discards all messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: Level, _message: &str) {}
}
