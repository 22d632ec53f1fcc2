//! Exec Log: the engine's structured log pipeline.
//!
//! Lookup degradation, generation failures, cache decisions and background
//! job outcomes all flow through one [`ExecLogger`] that fans out to sinks.
//!
//! ```text
//! Engine / Scheduler workers
//!           │
//!           ▼
//!     ExecLogger::log(entry)
//!           │
//!        ┌──┴──┐
//!        ▼     ▼
//!    tracing  memory
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// A structured log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Component that emitted the entry (e.g. "engine", "store", "job:persist").
    pub source: String,
    /// Request hash the entry concerns, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            request_hash: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.request_hash = Some(hash.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// First 12 chars of the request hash, enough to grep for.
    pub fn short_hash(&self) -> Option<&str> {
        self.request_hash
            .as_deref()
            .map(|h| h.get(..12).unwrap_or(h))
    }
}

pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);

    fn flush(&self) {}
}

/// Fans entries out to every attached sink above the minimum level.
pub struct ExecLogger {
    sinks: Vec<Arc<dyn LogSink>>,
    min_level: LogLevel,
}

impl ExecLogger {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            min_level: LogLevel::Debug,
        }
    }

    /// Logger with a single [`TracingSink`] attached.
    pub fn tracing() -> Self {
        let mut logger = Self::new();
        logger.add_sink(Arc::new(TracingSink));
        logger
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }

    pub fn log(&self, entry: &LogEntry) {
        if entry.level < self.min_level {
            return;
        }
        for sink in &self.sinks {
            sink.write(entry);
        }
    }

    pub fn debug(&self, source: &str, hash: Option<&str>, message: &str) {
        self.log_at(LogLevel::Debug, source, hash, message);
    }

    pub fn info(&self, source: &str, hash: Option<&str>, message: &str) {
        self.log_at(LogLevel::Info, source, hash, message);
    }

    pub fn warn(&self, source: &str, hash: Option<&str>, message: &str) {
        self.log_at(LogLevel::Warn, source, hash, message);
    }

    pub fn error(&self, source: &str, hash: Option<&str>, message: &str) {
        self.log_at(LogLevel::Error, source, hash, message);
    }

    fn log_at(&self, level: LogLevel, source: &str, hash: Option<&str>, message: &str) {
        let mut entry = LogEntry::new(level, source, message);
        if let Some(h) = hash {
            entry = entry.with_hash(h);
        }
        self.log(&entry);
    }

    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl Default for ExecLogger {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Built-in Sinks ────────────────────────────────────────────────────────

/// Forwards entries to the `tracing` subscriber installed by the host.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, entry: &LogEntry) {
        let hash = entry.short_hash().unwrap_or("-");
        match entry.level {
            LogLevel::Trace => tracing::trace!(source = %entry.source, hash, "{}", entry.message),
            LogLevel::Debug => tracing::debug!(source = %entry.source, hash, "{}", entry.message),
            LogLevel::Info => tracing::info!(source = %entry.source, hash, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(source = %entry.source, hash, "{}", entry.message),
            LogLevel::Error => tracing::error!(source = %entry.source, hash, "{}", entry.message),
        }
    }
}

/// Collects entries in memory (tests, inspection).
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.guard().clone()
    }

    /// Entries whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<LogEntry> {
        self.guard()
            .iter()
            .filter(|e| e.message.contains(needle))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemorySink {
    fn write(&self, entry: &LogEntry) {
        self.guard().push(entry.clone());
    }
}
