//! Leaked-tool diagnostics.
//!
//! Every detected leak is recorded through a [`DiagnosticSink`]. With a log
//! file configured, entries are appended to it as JSONL by a background task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Longest raw snippet kept per candidate.
const MAX_RAW_CHARS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticCandidate {
    pub start: usize,
    pub end: usize,
    pub raw: String,
    /// `None` when the candidate was recovered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub model: String,
    /// Whether recovery was enabled for this response.
    pub fix_enabled: bool,
    pub recovered: usize,
    pub candidates: Vec<DiagnosticCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,
}

impl DiagnosticEntry {
    pub fn new(model: impl Into<String>, fix_enabled: bool, candidates: Vec<DiagnosticCandidate>) -> Self {
        let recovered = candidates.iter().filter(|c| c.failure.is_none()).count();
        let level = if fix_enabled && recovered == candidates.len() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        Self {
            timestamp: Utc::now(),
            level,
            model: model.into(),
            fix_enabled,
            recovered,
            candidates,
            raw_response: None,
        }
    }

    pub fn with_raw_response(mut self, raw: serde_json::Value) -> Self {
        self.raw_response = Some(raw);
        self
    }
}

pub fn truncate_raw(raw: &str) -> String {
    match raw.char_indices().nth(MAX_RAW_CHARS) {
        Some((cut, _)) => format!("{}...", &raw[..cut]),
        None => raw.to_string(),
    }
}

/// Destination for leaked-tool diagnostics.
pub trait DiagnosticSink: Send + Sync {
    /// Record an entry. Implementations drop the entry rather than block.
    fn record(&self, entry: DiagnosticEntry);
}

/// Append-only JSONL log.
///
/// Entries are handed to a background task over a channel, so recording is
/// never blocked by file I/O. The task runs until every handle is dropped.
#[derive(Clone)]
pub struct DiagnosticLog {
    tx: mpsc::UnboundedSender<DiagnosticEntry>,
}

impl DiagnosticLog {
    /// Open (or create) `file_path` for appending and spawn the writer task.
    /// Must be called from within a tokio runtime.
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(file_path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_entries(rx, tokio::fs::File::from_std(file)));
        Ok(Self { tx })
    }
}

impl std::fmt::Debug for DiagnosticLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticLog").finish_non_exhaustive()
    }
}

impl DiagnosticSink for DiagnosticLog {
    fn record(&self, entry: DiagnosticEntry) {
        TracingSink.record_summary(&entry);
        if let Err(e) = self.tx.send(entry) {
            tracing::warn!(error = %e, "Diagnostic writer stopped, entry dropped");
        }
    }
}

async fn write_entries(mut rx: mpsc::UnboundedReceiver<DiagnosticEntry>, mut file: tokio::fs::File) {
    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize diagnostic entry");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "Failed to write diagnostic entry");
            continue;
        }
        if let Err(e) = file.flush().await {
            tracing::warn!(error = %e, "Failed to flush diagnostic log");
        }
    }
    tracing::debug!("Diagnostic writer shutting down");
}

/// Sink that only emits tracing events; used when no log file is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    fn record_summary(&self, entry: &DiagnosticEntry) {
        tracing::warn!(
            model = %entry.model,
            fix_enabled = entry.fix_enabled,
            candidates = entry.candidates.len(),
            recovered = entry.recovered,
            "Leaked tool call detected"
        );
    }
}

impl DiagnosticSink for TracingSink {
    fn record(&self, entry: DiagnosticEntry) {
        self.record_summary(&entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn candidate(failure: Option<&str>) -> DiagnosticCandidate {
        DiagnosticCandidate {
            start: 0,
            end: 10,
            raw: "{'id': 'toolu_1'}".to_string(),
            failure: failure.map(String::from),
        }
    }

    #[test]
    fn test_entry_level() {
        let ok = DiagnosticEntry::new("claudesonnet4", true, vec![candidate(None)]);
        assert_eq!(ok.level, LogLevel::Info);
        assert_eq!(ok.recovered, 1);

        let failed = DiagnosticEntry::new("claudesonnet4", true, vec![candidate(Some("unbalanced"))]);
        assert_eq!(failed.level, LogLevel::Warn);

        let disabled = DiagnosticEntry::new("claudesonnet4", false, vec![candidate(None)]);
        assert_eq!(disabled.level, LogLevel::Warn);
    }

    async fn read_lines(path: &Path, want: usize) -> Vec<DiagnosticEntry> {
        for _ in 0..100 {
            let text = tokio::fs::read_to_string(path).await.unwrap_or_default();
            let entries: Vec<DiagnosticEntry> = text
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect();
            if entries.len() >= want {
                return entries;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("diagnostic log never reached {want} entries");
    }

    #[tokio::test]
    async fn test_log_appends_jsonl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("leaks.jsonl");

        let log = DiagnosticLog::new(&path).unwrap();
        log.record(DiagnosticEntry::new("a", true, vec![candidate(None)]));
        log.record(
            DiagnosticEntry::new("b", true, vec![])
                .with_raw_response(serde_json::json!({"response": "x"})),
        );

        let entries = read_lines(&path, 2).await;
        assert_eq!(entries[0].model, "a");
        assert_eq!(entries[0].recovered, 1);
        assert_eq!(entries[1].raw_response, Some(serde_json::json!({"response": "x"})));
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leaks.jsonl");

        DiagnosticLog::new(&path).unwrap().record(DiagnosticEntry::new("first", true, vec![]));
        read_lines(&path, 1).await;

        DiagnosticLog::new(&path).unwrap().record(DiagnosticEntry::new("second", true, vec![]));
        let entries = read_lines(&path, 2).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].model, "second");
    }

    #[test]
    fn test_truncate_raw() {
        let long = "x".repeat(MAX_RAW_CHARS + 5);
        assert!(truncate_raw(&long).ends_with("..."));
        assert_eq!(truncate_raw("short"), "short");
    }
}
