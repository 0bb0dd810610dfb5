//! Streaming decoder for the chat message archive (a `chat.db`-style
//! SQLite store).
//!
//! Messages are read through a single streaming query ordered by
//! `(contact, date)` ascending — the conversation chunker depends on that
//! ordering. Rows are decoded one at a time and sent into a bounded
//! channel, so arbitrarily large histories never materialize in memory.
//! The channel closing signals end of stream; the stream is not
//! restartable.
//!
//! A message's text comes from the `text` column when present; otherwise
//! it is recovered from the `attributedBody` blob, a serialized
//! attributed-string. Rows with no recoverable text are skipped silently.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::TryStreamExt;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Row};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::models::RawMessage;

/// Seconds between the Unix epoch and the store's native epoch (2001-01-01 UTC).
const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Marker preceding the text payload inside an `attributedBody` blob.
const TEXT_MARKER: &[u8] = b"NSString";
/// Byte introducing the variable-length size field after the marker.
const LENGTH_INTRODUCER: u8 = 0x2B;

/// Channel capacity for decoded messages. Bounded so a slow consumer
/// (embedding calls) backpressures the reader instead of buffering.
const CHANNEL_CAPACITY: usize = 64;

/// Convert a native nanosecond timestamp to UTC.
pub fn native_ts_to_utc(native_ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(native_ns + APPLE_EPOCH_OFFSET_SECS * NANOS_PER_SEC)
}

/// Convert a UTC datetime back to a native nanosecond timestamp.
/// Inverse of [`native_ts_to_utc`] within integer truncation.
pub fn utc_to_native_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_nanos_opt().unwrap_or(i64::MAX) - APPLE_EPOCH_OFFSET_SECS * NANOS_PER_SEC
}

/// Extract plain text from a serialized attributed-string blob.
///
/// The text payload sits after the `NSString` marker: type-descriptor
/// bytes, then the `0x2B` introducer, then a size field — one byte below
/// `0x80` is the length itself, otherwise its low 7 bits count the
/// little-endian bytes that follow and hold the length. Any malformed or
/// out-of-bounds field yields `None` rather than an error; callers skip
/// such records.
pub fn decode_attributed_body(blob: &[u8]) -> Option<String> {
    let marker_at = blob
        .windows(TEXT_MARKER.len())
        .position(|w| w == TEXT_MARKER)?;

    let mut pos = marker_at + TEXT_MARKER.len();
    while pos < blob.len() && blob[pos] != LENGTH_INTRODUCER {
        pos += 1;
    }
    pos += 1; // past the introducer

    let length_byte = *blob.get(pos)?;
    pos += 1;

    let text_len = if length_byte < 0x80 {
        length_byte as usize
    } else {
        let num_extra = (length_byte & 0x7F) as usize;
        let extra = blob.get(pos..pos + num_extra)?;
        pos += num_extra;
        let mut len: u64 = 0;
        for (i, b) in extra.iter().enumerate() {
            len |= (*b as u64) << (8 * i);
        }
        usize::try_from(len).ok()?
    };

    let text = blob.get(pos..pos + text_len)?;
    Some(String::from_utf8_lossy(text).into_owned())
}

const MESSAGE_QUERY: &str = "\
    SELECT \
        m.ROWID AS rowid, \
        m.text AS text, \
        m.attributedBody AS attributed_body, \
        m.date AS date, \
        m.is_from_me AS is_from_me, \
        COALESCE(h.id, 'unknown') AS contact \
    FROM message m \
    LEFT JOIN handle h ON m.handle_id = h.ROWID \
    WHERE ((m.text IS NOT NULL AND m.text != '') OR m.attributedBody IS NOT NULL)";

/// Stream messages from the chat store, optionally bounded by an
/// inclusive `since` cutoff (applied in SQL against the native timestamp).
///
/// Returns a receiver of decoded messages in `(contact, date)` order. A
/// terminal `Err` means the underlying read failed; individual malformed
/// rows are skipped, not reported.
pub fn stream_messages(
    config: &Config,
    since: Option<DateTime<Utc>>,
) -> mpsc::Receiver<Result<RawMessage>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let db_path = config.archives.chat_db.clone();

    tokio::spawn(async move {
        if let Err(e) = read_all(&db_path, since, &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    });

    rx
}

async fn read_all(
    db_path: &std::path::Path,
    since: Option<DateTime<Utc>>,
    tx: &mpsc::Sender<Result<RawMessage>>,
) -> Result<()> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(true);
    let mut conn = options.connect().await?;

    let mut sql = MESSAGE_QUERY.to_string();
    if since.is_some() {
        sql.push_str(" AND m.date >= ?");
    }
    sql.push_str(" ORDER BY contact, m.date");

    let mut query = sqlx::query(&sql);
    if let Some(cutoff) = since {
        query = query.bind(utc_to_native_ts(cutoff));
    }

    let mut rows = query.fetch(&mut conn);
    while let Some(row) = rows.try_next().await? {
        let Some(msg) = decode_row(&row) else {
            continue;
        };
        if tx.send(Ok(msg)).await.is_err() {
            // Receiver gone — consumer stopped early.
            break;
        }
    }

    Ok(())
}

/// Decode one message row, preferring the plain-text column over the
/// attributed-body blob. Returns `None` for rows with no usable text or
/// with unexpected column types — both are skipped.
fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Option<RawMessage> {
    let rowid: i64 = row.try_get("rowid").ok()?;
    let date: i64 = row.try_get("date").ok()?;
    let is_from_me: i64 = row.try_get("is_from_me").ok()?;
    let contact: String = row.try_get("contact").ok()?;

    let text: Option<String> = row.try_get("text").ok()?;
    let text = match text.filter(|t| !t.is_empty()) {
        Some(t) => t,
        None => {
            let blob: Option<Vec<u8>> = row.try_get("attributed_body").ok()?;
            let decoded = blob.as_deref().and_then(decode_attributed_body);
            match decoded.filter(|t| !t.is_empty()) {
                Some(t) => t,
                None => {
                    debug!(rowid, "no recoverable text, skipping message");
                    return None;
                }
            }
        }
    };

    Some(RawMessage {
        rowid,
        text,
        timestamp: native_ts_to_utc(date),
        is_self: is_from_me != 0,
        contact,
    })
}
