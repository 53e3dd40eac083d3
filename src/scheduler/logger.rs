//! Pluggable logger for director and worker diagnostics.
//!
//! The director reports through a two-channel [`Logger`] rather than calling
//! `tracing` directly, so embedders can route tick failures and detail logs
//! wherever they like. [`TracingLogger`] is the default and forwards to
//! `tracing`.

use std::sync::{Mutex, MutexGuard};

/// Minimal logging interface with informational and error channels.
pub trait Logger: Send + Sync {
    /// Logs an informational message.
    fn info(&self, message: &str);

    /// Logs an error message.
    fn error(&self, message: &str);
}

/// Logger that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(target: "queue_director", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "queue_director", "{}", message);
    }
}

/// Severity of a recorded log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

/// Logger that keeps every line in memory.
///
/// Useful for tests and for surfacing director output in another UI.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLogger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    fn lines(&self) -> MutexGuard<'_, Vec<(LogLevel, String)>> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns all recorded lines.
    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.lines().clone()
    }

    /// Returns the recorded messages of one level.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.lines()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Whether any line of `level` contains `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl Logger for MemoryLogger {
    fn info(&self, message: &str) {
        self.lines().push((LogLevel::Info, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.lines().push((LogLevel::Error, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_logger_records_levels() {
        let logger = MemoryLogger::new();
        logger.info("QUEUE LENGTH 4");
        logger.error("store down");

        assert_eq!(logger.entries().len(), 2);
        assert_eq!(logger.messages(LogLevel::Info), vec!["QUEUE LENGTH 4"]);
        assert!(logger.contains(LogLevel::Error, "down"));
        assert!(!logger.contains(LogLevel::Info, "down"));
    }

    #[test]
    fn test_tracing_logger_is_object_safe() {
        let logger: Box<dyn Logger> = Box::new(TracingLogger);
        logger.info("hello");
        logger.error("world");
    }
}
