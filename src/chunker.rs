//! Grouping of raw records into retrieval chunks.
//!
//! Chat messages are grouped by conversation window: a chunk boundary
//! falls on every contact change and on every gap longer than the
//! configured window between consecutive messages. Mail is chunked one
//! message per chunk.

use chrono::Duration;
use serde_json::json;

use crate::models::{Chunk, RawMail, RawMessage, Source};

/// Label used for the user's own messages in rendered chunk text.
const SELF_LABEL: &str = "Me";

/// Streaming state machine that groups an ordered message stream into
/// conversation chunks. Holds at most one open buffer; feed messages with
/// [`push`](Self::push) and drain the final buffer with
/// [`flush`](Self::flush) at end of stream.
///
/// Expects messages ordered by `(contact, timestamp)`, as the chat
/// decoder produces them.
pub struct ConversationChunker {
    window: Duration,
    buffer: Vec<RawMessage>,
}

impl ConversationChunker {
    pub fn new(window_hours: i64) -> Self {
        Self {
            window: Duration::hours(window_hours),
            buffer: Vec::new(),
        }
    }

    /// Feed the next message. Returns the completed chunk when `msg`
    /// starts a new conversation group, otherwise `None`.
    pub fn push(&mut self, msg: RawMessage) -> Option<Chunk> {
        let boundary = match self.buffer.last() {
            None => false,
            Some(last) => {
                last.contact != msg.contact || msg.timestamp - last.timestamp > self.window
            }
        };

        if boundary {
            let chunk = self.take_chunk();
            self.buffer.push(msg);
            chunk
        } else {
            self.buffer.push(msg);
            None
        }
    }

    /// Emit the final open buffer, if any. Call once at end of stream.
    pub fn flush(&mut self) -> Option<Chunk> {
        self.take_chunk()
    }

    fn take_chunk(&mut self) -> Option<Chunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let messages = std::mem::take(&mut self.buffer);
        Some(conversation_chunk(&messages))
    }
}

/// Render one conversation group as a chunk: one line per message,
/// `[time] sender: text`, with the self label for outgoing messages.
fn conversation_chunk(messages: &[RawMessage]) -> Chunk {
    let contact = messages[0].contact.clone();
    let lines: Vec<String> = messages
        .iter()
        .map(|msg| {
            let sender = if msg.is_self { SELF_LABEL } else { &contact };
            format!(
                "[{}] {}: {}",
                msg.timestamp.format("%Y-%m-%d %H:%M"),
                sender,
                msg.text
            )
        })
        .collect();

    Chunk {
        source: Source::Chat,
        contact,
        start_time: messages[0].timestamp,
        end_time: messages[messages.len() - 1].timestamp,
        text: lines.join("\n"),
        message_count: messages.len() as i64,
        metadata: json!({}),
    }
}

/// One mail message maps to one chunk: a header block, a blank line, and
/// the body.
pub fn mail_chunk(mail: &RawMail) -> Chunk {
    let text = format!(
        "From: {}\nTo: {}\nDate: {}\nSubject: {}\n\n{}",
        mail.sender,
        mail.recipients,
        mail.timestamp.format("%Y-%m-%d %H:%M"),
        mail.subject,
        mail.body
    );

    Chunk {
        source: Source::Mail,
        contact: mail.sender.clone(),
        start_time: mail.timestamp,
        end_time: mail.timestamp,
        text,
        message_count: 1,
        metadata: json!({
            "subject": mail.subject,
            "message_id": mail.message_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(contact: &str, hour_offset: i64, is_self: bool, text: &str) -> RawMessage {
        RawMessage {
            rowid: hour_offset,
            text: text.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
                + Duration::hours(hour_offset),
            is_self,
            contact: contact.to_string(),
        }
    }

    fn drain(chunker: &mut ConversationChunker, messages: Vec<RawMessage>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for m in messages {
            if let Some(c) = chunker.push(m) {
                chunks.push(c);
            }
        }
        if let Some(c) = chunker.flush() {
            chunks.push(c);
        }
        chunks
    }

    #[test]
    fn gap_over_window_splits() {
        let mut chunker = ConversationChunker::new(4);
        // t, t+1h, t+5h: the 4h gap between the second and third message splits.
        let chunks = drain(
            &mut chunker,
            vec![
                msg("alice", 0, false, "hey"),
                msg("alice", 1, true, "hi!"),
                msg("alice", 5, false, "still there?"),
            ],
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].message_count, 2);
        assert_eq!(chunks[1].message_count, 1);
        assert_eq!(chunks[0].end_time, chunks[0].start_time + Duration::hours(1));
    }

    #[test]
    fn gap_exactly_window_stays_open() {
        let mut chunker = ConversationChunker::new(4);
        let chunks = drain(
            &mut chunker,
            vec![msg("alice", 0, false, "a"), msg("alice", 4, false, "b")],
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].message_count, 2);
    }

    #[test]
    fn contact_change_always_splits() {
        let mut chunker = ConversationChunker::new(4);
        let chunks = drain(
            &mut chunker,
            vec![
                msg("alice", 0, false, "a"),
                msg("bob", 0, false, "b"),
                msg("carol", 0, false, "c"),
            ],
        );
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].contact, "alice");
        assert_eq!(chunks[1].contact, "bob");
        assert_eq!(chunks[2].contact, "carol");
    }

    #[test]
    fn renders_self_label_and_timestamps() {
        let mut chunker = ConversationChunker::new(4);
        let chunks = drain(
            &mut chunker,
            vec![msg("alice", 0, false, "hey"), msg("alice", 1, true, "hi!")],
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].text,
            "[2024-03-01 09:00] alice: hey\n[2024-03-01 10:00] Me: hi!"
        );
    }

    #[test]
    fn empty_stream_emits_nothing() {
        let mut chunker = ConversationChunker::new(4);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn mail_chunk_is_identity() {
        let mail = RawMail {
            path: "/tmp/1.emlx".to_string(),
            subject: "lunch".to_string(),
            sender: "alice@example.com".to_string(),
            recipients: "bob@example.com".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            body: "tomorrow?".to_string(),
            message_id: "<1@x>".to_string(),
        };
        let chunk = mail_chunk(&mail);
        assert_eq!(chunk.source, Source::Mail);
        assert_eq!(chunk.start_time, chunk.end_time);
        assert_eq!(chunk.message_count, 1);
        assert_eq!(
            chunk.text,
            "From: alice@example.com\nTo: bob@example.com\nDate: 2024-03-01 12:00\nSubject: lunch\n\ntomorrow?"
        );
        assert_eq!(chunk.metadata["subject"], "lunch");
    }
}
