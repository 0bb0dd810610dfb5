//! Ingest progress reporting.
//!
//! Reports observable progress while an archive is being ingested so users
//! see chunks flowing and know the run is alive. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts. Background tasks use
//! their own observer (task counters); these reporters serve the CLI path.

use std::io::Write;

use crate::models::Source;

/// Receives running totals from the ingest pipeline, once per stored chunk.
pub trait IngestObserver: Send + Sync {
    fn on_chunk(&self, source: Source, chunks: u64, messages: u64);
}

/// Human-friendly progress on stderr: "ingest chat  412 chunks (3,120 messages)".
pub struct StderrProgress {
    every: u64,
}

impl StderrProgress {
    pub fn new() -> Self {
        Self { every: 10 }
    }
}

impl Default for StderrProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestObserver for StderrProgress {
    fn on_chunk(&self, source: Source, chunks: u64, messages: u64) {
        if chunks % self.every != 0 {
            return;
        }
        let line = format!(
            "ingest {}  {} chunks ({} messages)\r",
            source,
            format_number(chunks),
            format_number(messages)
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestObserver for JsonProgress {
    fn on_chunk(&self, source: Source, chunks: u64, messages: u64) {
        let obj = serde_json::json!({
            "event": "progress",
            "source": source,
            "chunks": chunks,
            "messages": messages,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op observer when progress is disabled.
pub struct NoProgress;

impl IngestObserver for NoProgress {
    fn on_chunk(&self, _source: Source, _chunks: u64, _messages: u64) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn observer(&self) -> Box<dyn IngestObserver> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress::new()),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
