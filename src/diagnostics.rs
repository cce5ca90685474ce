use std::sync::Mutex;

use crate::error::RecordError;

/// Per-file counters reported when a file completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSummary {
    /// Records read in the aggregation pass, malformed ones included.
    pub records: u64,
    pub candidates: usize,
    /// Records folded into a target.
    pub retained: u64,
    pub skipped: u64,
    pub sources: usize,
}

/// Where the engine reports progress and absorbed errors.
///
/// Passed to the worker pool explicitly; the engine never touches a global logger.
pub trait DiagnosticSink: Send + Sync {
    fn file_started(&self, _file: &str) {}
    fn file_finished(&self, file: &str, summary: &FileSummary);
    fn file_failed(&self, file: &str, reason: &str);
    fn record_skipped(&self, file: &str, error: &RecordError);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn file_started(&self, file: &str) {
        tracing::debug!(file, "processing");
    }

    fn file_finished(&self, file: &str, summary: &FileSummary) {
        tracing::info!(
            file,
            records = summary.records,
            candidates = summary.candidates,
            retained = summary.retained,
            skipped = summary.skipped,
            "file done"
        );
    }

    fn file_failed(&self, file: &str, reason: &str) {
        tracing::warn!(file, reason, "file failed");
    }

    fn record_skipped(&self, file: &str, error: &RecordError) {
        tracing::debug!(file, "skipping record: {error}");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    Started(String),
    Finished(String, FileSummary),
    Failed(String, String),
    Skipped(String, RecordError),
}

/// Collects diagnostics in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, event: Diagnostic) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl DiagnosticSink for MemorySink {
    fn file_started(&self, file: &str) {
        self.push(Diagnostic::Started(file.to_string()));
    }

    fn file_finished(&self, file: &str, summary: &FileSummary) {
        self.push(Diagnostic::Finished(file.to_string(), *summary));
    }

    fn file_failed(&self, file: &str, reason: &str) {
        self.push(Diagnostic::Failed(file.to_string(), reason.to_string()));
    }

    fn record_skipped(&self, file: &str, error: &RecordError) {
        self.push(Diagnostic::Skipped(file.to_string(), error.clone()));
    }
}
