//! Core data models used throughout the pipeline.
//!
//! These types represent the raw records, chunks, and search results that
//! flow from the archive decoders through chunking, embedding, storage,
//! and retrieval.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which archive a record or chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Chat,
    Mail,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Chat => "chat",
            Source::Mail => "mail",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Source::Chat),
            "mail" => Ok(Source::Mail),
            other => anyhow::bail!("unknown source '{}'. Available: chat, mail", other),
        }
    }
}

/// One message row decoded from the chat archive.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub rowid: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_self: bool,
    /// Contact identifier — phone number or address.
    pub contact: String,
}

/// One message parsed from the mail archive.
#[derive(Debug, Clone)]
pub struct RawMail {
    pub path: String,
    pub subject: String,
    pub sender: String,
    pub recipients: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub message_id: String,
}

/// One retrieval unit: a contiguous span of records rendered as a single
/// text block. Immutable once created; `(source, contact, start_time)` is
/// the dedup key the store upserts on.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub source: Source,
    pub contact: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub text: String,
    pub message_count: i64,
    pub metadata: serde_json::Value,
}

/// A stored chunk returned from the vector store, annotated with a
/// similarity score. `similarity` is 0.0 when the hit did not come from a
/// ranked search (e.g. `fetch_by_ids`).
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub source: Source,
    pub contact: String,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub message_count: i64,
    pub similarity: f32,
    pub metadata: serde_json::Value,
}

/// Redacted view of a search hit sent to clients in a `sources` event:
/// embedding omitted, text truncated, similarity rounded.
#[derive(Debug, Clone, Serialize)]
pub struct SourcePreview {
    pub contact: String,
    pub source: Source,
    pub start_time: f64,
    pub end_time: f64,
    pub message_count: i64,
    pub similarity: f64,
    pub text: String,
}

/// Preview length for `sources` events, in characters.
const PREVIEW_CHARS: usize = 300;

impl SourcePreview {
    pub fn from_hit(hit: &SearchHit) -> Self {
        let text = match hit.text.char_indices().nth(PREVIEW_CHARS) {
            Some((idx, _)) => hit.text[..idx].to_string(),
            None => hit.text.clone(),
        };
        SourcePreview {
            contact: hit.contact.clone(),
            source: hit.source,
            start_time: hit.start_time,
            end_time: hit.end_time,
            message_count: hit.message_count,
            similarity: (hit.similarity as f64 * 1000.0).round() / 1000.0,
            text,
        }
    }
}

/// One turn of a multi-turn conversation, as sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// One event of a streamed answer. Serialized as `{"type": ..., "data": ...}`.
///
/// Ordering contract per stream: `sources` exactly once, first; then zero
/// or more `token`s in backend arrival order; then `done` exactly once —
/// unless an `error` occurs, which is always the last event and suppresses
/// `done`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamEvent {
    Sources(Vec<SourcePreview>),
    Token(String),
    Done(String),
    Error(String),
}

impl StreamEvent {
    /// Successful-completion marker. Carries an empty payload so every
    /// event has the same `{"type", "data"}` wire shape.
    pub fn done() -> Self {
        StreamEvent::Done(String::new())
    }
}
