//! Transaction log — append-only record of every resolved transaction.
//!
//! Each entry is a self-contained, immutable record: command, raw and
//! cleaned response, outcome, timestamp, and wall-clock latency.
//! Consumers (the debug view) only ever see cloned snapshots. The log
//! can additionally be exported as JSON lines for grepping and
//! post-processing.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// How a transaction resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail")]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A response unit arrived before the deadline.
    Resolved,
    /// No response within the per-call timeout.
    TimedOut,
    /// The transaction failed (process death, interrupt, write error,
    /// framing overflow). Carries a short human-readable reason.
    Failed(String),
}

/// One resolved transaction.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub command: String,
    /// Sentinel-delimited response slice as the child produced it.
    pub raw: String,
    /// Response payload with echo and prompt noise removed.
    pub cleaned: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    /// When the transaction resolved.
    pub timestamp: DateTime<Utc>,
    /// Wall-clock latency from submission to resolution.
    pub elapsed_secs: f64,
}

impl LogEntry {
    pub fn new(command: &str, outcome: Outcome, elapsed_secs: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.to_string(),
            raw: String::new(),
            cleaned: String::new(),
            outcome,
            timestamp: Utc::now(),
            elapsed_secs,
        }
    }

    pub fn with_response(mut self, raw: &str, cleaned: &str) -> Self {
        self.raw = raw.to_string();
        self.cleaned = cleaned.to_string();
        self
    }
}

/// Append-only transaction log. `record` never fails; readers get
/// snapshots, never references into shared state.
#[derive(Default)]
pub struct TransactionLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    /// Full ordered snapshot.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export the log as JSON lines, one entry per line, appending to
    /// `path`.
    pub fn export_jsonl(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for entry in self.entries() {
            let line = serde_json::to_string(&entry).context("failed to serialize log entry")?;
            writeln!(writer, "{line}")?;
        }
        writer.flush().context("failed to flush log file")?;
        Ok(())
    }
}
