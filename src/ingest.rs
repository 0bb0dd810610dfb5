//! Ingestion pipeline orchestration.
//!
//! Drives the full flow for one archive: decoder → chunker → embedding →
//! store. The same pipeline serves the CLI (with a stderr progress
//! observer) and background tasks (with an observer that updates task
//! counters).
//!
//! Cancellation is cooperative: the flag is checked once per chunk,
//! before the chunk's embedding call. An embedding call already in flight
//! is never interrupted. Per-chunk embedding failures are logged and the
//! chunk skipped; they do not abort the run.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::chat;
use crate::chunker::{mail_chunk, ConversationChunker};
use crate::config::Config;
use crate::embedding;
use crate::mail;
use crate::models::{Chunk, Source};
use crate::progress::IngestObserver;
use crate::store::Store;

/// How an ingest run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub outcome: PipelineOutcome,
    pub chunks_stored: u64,
    pub messages_stored: u64,
    pub chunks_skipped: u64,
}

/// Parse a relative time like `30d` or `24h` into a UTC cutoff.
pub fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    let mut chars = value.chars();
    let unit = chars
        .next_back()
        .ok_or_else(|| anyhow::anyhow!("empty time value"))?;
    let amount: i64 = chars
        .as_str()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid time value '{}'", value))?;
    let now = Utc::now();
    match unit.to_ascii_lowercase() {
        'd' => Ok(now - Duration::days(amount)),
        'h' => Ok(now - Duration::hours(amount)),
        other => anyhow::bail!("unknown time unit '{}'. Use 'd' (days) or 'h' (hours).", other),
    }
}

struct Totals {
    chunks_stored: u64,
    messages_stored: u64,
    chunks_skipped: u64,
}

/// Run one full ingest of `source`. Returns the totals, or an error when
/// the decoder or the store fails — embedding failures only skip the
/// affected chunk.
pub async fn run_pipeline(
    config: &Config,
    source: Source,
    since: Option<DateTime<Utc>>,
    observer: &dyn IngestObserver,
    cancel: &AtomicBool,
) -> Result<PipelineSummary> {
    let store = Store::from_config(config);
    let mut totals = Totals {
        chunks_stored: 0,
        messages_stored: 0,
        chunks_skipped: 0,
    };

    let outcome = match source {
        Source::Chat => ingest_chat(config, since, &store, observer, cancel, &mut totals).await?,
        Source::Mail => ingest_mail(config, since, &store, observer, cancel, &mut totals).await?,
    };

    Ok(PipelineSummary {
        outcome,
        chunks_stored: totals.chunks_stored,
        messages_stored: totals.messages_stored,
        chunks_skipped: totals.chunks_skipped,
    })
}

async fn ingest_chat(
    config: &Config,
    since: Option<DateTime<Utc>>,
    store: &Store,
    observer: &dyn IngestObserver,
    cancel: &AtomicBool,
    totals: &mut Totals,
) -> Result<PipelineOutcome> {
    let mut records = chat::stream_messages(config, since);
    let mut chunker = ConversationChunker::new(config.chunking.window_hours);

    while let Some(record) = records.recv().await {
        let msg = record?;
        if let Some(chunk) = chunker.push(msg) {
            if cancel.load(Ordering::Relaxed) {
                return Ok(PipelineOutcome::Cancelled);
            }
            process_chunk(config, store, &chunk, observer, totals).await?;
        }
    }

    if let Some(chunk) = chunker.flush() {
        if cancel.load(Ordering::Relaxed) {
            return Ok(PipelineOutcome::Cancelled);
        }
        process_chunk(config, store, &chunk, observer, totals).await?;
    }

    Ok(PipelineOutcome::Completed)
}

async fn ingest_mail(
    config: &Config,
    since: Option<DateTime<Utc>>,
    store: &Store,
    observer: &dyn IngestObserver,
    cancel: &AtomicBool,
    totals: &mut Totals,
) -> Result<PipelineOutcome> {
    let mut records = mail::stream_mails(config, since);

    while let Some(record) = records.recv().await {
        let mail = record?;
        if cancel.load(Ordering::Relaxed) {
            return Ok(PipelineOutcome::Cancelled);
        }
        let chunk = mail_chunk(&mail);
        process_chunk(config, store, &chunk, observer, totals).await?;
    }

    Ok(PipelineOutcome::Completed)
}

/// Embed and store one chunk. An embedding failure logs a warning and
/// skips the chunk; a store failure propagates and aborts the run.
async fn process_chunk(
    config: &Config,
    store: &Store,
    chunk: &Chunk,
    observer: &dyn IngestObserver,
    totals: &mut Totals,
) -> Result<()> {
    let embedding = match embedding::embed_text(&config.embedding, &chunk.text).await {
        Ok(vec) => vec,
        Err(e) => {
            warn!(
                contact = %chunk.contact,
                start = %chunk.start_time.format("%Y-%m-%d %H:%M"),
                error = %e,
                "embedding failed, skipping chunk"
            );
            totals.chunks_skipped += 1;
            return Ok(());
        }
    };

    store.upsert(chunk, &embedding).await?;

    totals.chunks_stored += 1;
    totals.messages_stored += chunk.message_count as u64;
    observer.on_chunk(chunk.source, totals.chunks_stored, totals.messages_stored);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_since_days_and_hours() {
        let now = Utc::now();
        let d = parse_since("30d").unwrap();
        assert!((now - d).num_days() >= 29);
        let h = parse_since("24h").unwrap();
        assert!((now - h).num_hours() >= 23);
    }

    #[test]
    fn parse_since_rejects_garbage() {
        assert!(parse_since("30w").is_err());
        assert!(parse_since("d").is_err());
        assert!(parse_since("").is_err());
    }

    /// A cancel observed at the between-chunks checkpoint stops the run
    /// before the chunk is embedded or stored.
    #[tokio::test]
    async fn cancel_observed_before_first_chunk() {
        use crate::progress::NoProgress;

        let dir = tempfile::TempDir::new().unwrap();
        let mbox = dir.path().join("mail/INBOX.mbox");
        std::fs::create_dir_all(&mbox).unwrap();

        let rfc822 = "From: a@b.c\r\n\
             Subject: hi\r\n\
             Date: Thu, 15 Jun 2023 12:00:00 +0000\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             hello";
        let mut raw = format!("{}\n", rfc822.len()).into_bytes();
        raw.extend_from_slice(rfc822.as_bytes());
        std::fs::write(mbox.join("1.emlx"), raw).unwrap();

        let mut config = Config::default();
        config.db.path = dir.path().join("vectors.db");
        config.archives.mail_dir = dir.path().join("mail");
        // Unreachable on purpose: a cancelled run must never get as far
        // as an embedding call.
        config.embedding.url = "http://127.0.0.1:1".to_string();

        let cancel = AtomicBool::new(true);
        let summary = run_pipeline(&config, Source::Mail, None, &NoProgress, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.outcome, PipelineOutcome::Cancelled);
        assert_eq!(summary.chunks_stored, 0);
        assert_eq!(summary.chunks_skipped, 0);
        // Nothing was stored, so the store file was never created.
        assert!(!dir.path().join("vectors.db").exists());
    }
}
