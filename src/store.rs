//! SQLite-backed vector store with brute-force cosine similarity search.
//!
//! One table holds chunks, their embeddings (little-endian f32 BLOBs),
//! and metadata. A unique index on `(source, contact, start_time)` is the
//! dedup key: re-ingesting the same logical chunk updates it in place.
//!
//! Search is an exhaustive scan — every stored vector is compared against
//! the query. At personal-archive scale this stays well within
//! interactive latency and needs no index maintenance.
//!
//! Connections are short-lived: every operation opens one connection,
//! ensures the schema, runs, and closes. Nothing is held across a network
//! round-trip to an external service.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row};

use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, SearchHit, Source};

/// Bounds applied to every `top_k` request.
const MIN_TOP_K: usize = 1;
const MAX_TOP_K: usize = 50;

#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

/// Row counts and on-disk size. All zero when the store has never been
/// created — that is a normal state, not an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_chunks: i64,
    pub by_source: BTreeMap<String, i64>,
    pub db_size_bytes: u64,
}

/// Convert a datetime to fractional epoch seconds for storage.
pub fn to_epoch_secs(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

impl Store {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.db.path.clone())
    }

    /// Open a connection, creating the database file and schema on first
    /// use.
    async fn open(&self) -> Result<SqliteConnection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);
        let mut conn = options.connect().await?;
        ensure_schema(&mut conn).await?;
        Ok(conn)
    }

    /// Insert a chunk with its embedding, or update the existing row with
    /// the same dedup key. Returns the row id. Safe to call repeatedly
    /// with the same key.
    pub async fn upsert(&self, chunk: &Chunk, embedding: &[f32]) -> Result<i64> {
        let mut conn = self.open().await?;

        let metadata_json = match &chunk.metadata {
            serde_json::Value::Object(map) if map.is_empty() => None,
            serde_json::Value::Null => None,
            other => Some(serde_json::to_string(other)?),
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chunks (source, contact, start_time, end_time, text, message_count, embedding, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, contact, start_time) DO UPDATE SET
                end_time = excluded.end_time,
                text = excluded.text,
                message_count = excluded.message_count,
                embedding = excluded.embedding,
                metadata = excluded.metadata,
                created_at = unixepoch()
            RETURNING id
            "#,
        )
        .bind(chunk.source.as_str())
        .bind(&chunk.contact)
        .bind(to_epoch_secs(chunk.start_time))
        .bind(to_epoch_secs(chunk.end_time))
        .bind(&chunk.text)
        .bind(chunk.message_count)
        .bind(vec_to_blob(embedding))
        .bind(metadata_json)
        .fetch_one(&mut conn)
        .await?;

        conn.close().await?;
        Ok(id)
    }

    /// Find the `top_k` most similar chunks by cosine similarity.
    ///
    /// `top_k` is clamped to `[1, 50]`. Rows with a zero-norm embedding
    /// are excluded; a zero-norm query returns no results. Ties keep
    /// ascending-id order (the scan order), so results are deterministic.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        source: Option<Source>,
    ) -> Result<Vec<SearchHit>> {
        let top_k = top_k.clamp(MIN_TOP_K, MAX_TOP_K);

        if query.iter().all(|v| *v == 0.0) {
            return Ok(Vec::new());
        }

        let mut conn = self.open().await?;

        let mut sql = String::from(
            "SELECT id, source, contact, start_time, end_time, text, message_count, embedding, metadata \
             FROM chunks WHERE embedding IS NOT NULL",
        );
        if source.is_some() {
            sql.push_str(" AND source = ?");
        }
        sql.push_str(" ORDER BY id");

        let mut query_builder = sqlx::query(&sql);
        if let Some(src) = source {
            query_builder = query_builder.bind(src.as_str());
        }
        let rows = query_builder.fetch_all(&mut conn).await?;
        conn.close().await?;

        let mut scored: Vec<SearchHit> = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let embedding = blob_to_vec(&blob);
            if embedding.iter().all(|v| *v == 0.0) {
                continue;
            }
            let similarity = cosine_similarity(query, &embedding);
            scored.push(hit_from_row(row, similarity)?);
        }

        // Stable sort: equal similarities keep scan order.
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);

        Ok(scored)
    }

    /// Fetch chunks by row id. Hits carry `similarity = 0.0` to mark that
    /// they did not come from a ranked search.
    pub async fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<SearchHit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.open().await?;

        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, source, contact, start_time, end_time, text, message_count, metadata \
             FROM chunks WHERE id IN ({})",
            placeholders
        );

        let mut query_builder = sqlx::query(&sql);
        for id in ids {
            query_builder = query_builder.bind(id);
        }
        let rows = query_builder.fetch_all(&mut conn).await?;
        conn.close().await?;

        rows.iter().map(|row| hit_from_row(row, 0.0)).collect()
    }

    /// Row counts and file size. Returns zeroed defaults when the store
    /// file has never been created, without creating it.
    pub async fn stats(&self) -> Result<StoreStats> {
        if !self.path.exists() {
            return Ok(StoreStats::default());
        }

        let mut conn = self.open().await?;

        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&mut conn)
            .await?;

        let source_rows = sqlx::query("SELECT source, COUNT(*) AS n FROM chunks GROUP BY source")
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;

        let mut by_source = BTreeMap::new();
        for row in &source_rows {
            by_source.insert(row.get::<String, _>("source"), row.get::<i64, _>("n"));
        }

        let db_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(StoreStats {
            total_chunks,
            by_source,
            db_size_bytes,
        })
    }
}

fn hit_from_row(row: &SqliteRow, similarity: f32) -> Result<SearchHit> {
    let source: String = row.get("source");
    let metadata: Option<String> = row.get("metadata");

    Ok(SearchHit {
        id: row.get("id"),
        source: source.parse()?,
        contact: row.get("contact"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        text: row.get("text"),
        message_count: row.get("message_count"),
        similarity,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_else(|| serde_json::json!({})),
    })
}

async fn ensure_schema(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            contact TEXT,
            start_time REAL,
            end_time REAL,
            text TEXT NOT NULL,
            message_count INTEGER,
            embedding BLOB,
            metadata TEXT,
            created_at REAL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_dedup ON chunks(source, contact, start_time)",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_contact ON chunks(contact)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> Store {
        Store::new(dir.path().join("vectors.db"))
    }

    fn chunk(source: Source, contact: &str, minute: u32, text: &str) -> Chunk {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap();
        Chunk {
            source,
            contact: contact.to_string(),
            start_time: ts,
            end_time: ts,
            text: text.to_string(),
            message_count: 1,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn upsert_same_key_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let c = chunk(Source::Chat, "alice", 0, "first text");
        let id1 = store.upsert(&c, &[1.0, 0.0]).await.unwrap();

        let mut c2 = c.clone();
        c2.text = "second text".to_string();
        c2.message_count = 3;
        let id2 = store.upsert(&c2, &[0.0, 1.0]).await.unwrap();

        assert_eq!(id1, id2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_chunks, 1);

        let hits = store.fetch_by_ids(&[id1]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "second text");
        assert_eq!(hits[0].message_count, 3);
        assert_eq!(hits[0].similarity, 0.0);
    }

    #[tokio::test]
    async fn search_ranks_identical_vector_first() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store
            .upsert(&chunk(Source::Chat, "alice", 0, "a"), &[1.0, 0.0, 0.0])
            .await
            .unwrap();
        store
            .upsert(&chunk(Source::Chat, "bob", 1, "b"), &[0.0, 1.0, 0.0])
            .await
            .unwrap();
        store
            .upsert(&chunk(Source::Chat, "carol", 2, "c"), &[0.7, 0.7, 0.0])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].contact, "alice");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!(hits[0].similarity >= hits[1].similarity);
        assert!(hits[1].similarity >= hits[2].similarity);
    }

    #[tokio::test]
    async fn search_excludes_zero_norm_rows_and_queries() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store
            .upsert(&chunk(Source::Chat, "alice", 0, "a"), &[0.0, 0.0])
            .await
            .unwrap();
        store
            .upsert(&chunk(Source::Chat, "bob", 1, "b"), &[1.0, 0.0])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].contact, "bob");

        let empty = store.search(&[0.0, 0.0], 5, None).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn search_clamps_top_k() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        for i in 0..5 {
            store
                .upsert(
                    &chunk(Source::Chat, &format!("contact{}", i), i, "text"),
                    &[1.0, i as f32],
                )
                .await
                .unwrap();
        }

        let hits = store.search(&[1.0, 1.0], 1000, None).await.unwrap();
        assert_eq!(hits.len(), 5);

        let hits = store.search(&[1.0, 1.0], 0, None).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn search_filters_by_source() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store
            .upsert(&chunk(Source::Chat, "alice", 0, "a"), &[1.0, 0.0])
            .await
            .unwrap();
        store
            .upsert(&chunk(Source::Mail, "bob@x.y", 1, "b"), &[1.0, 0.0])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], 5, Some(Source::Mail))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, Source::Mail);
    }

    #[tokio::test]
    async fn stats_zero_when_store_absent() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_chunks, 0);
        assert!(stats.by_source.is_empty());
        assert_eq!(stats.db_size_bytes, 0);
        // stats() must not create the file.
        assert!(!dir.path().join("vectors.db").exists());
    }

    #[tokio::test]
    async fn stats_counts_per_source() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store
            .upsert(&chunk(Source::Chat, "alice", 0, "a"), &[1.0])
            .await
            .unwrap();
        store
            .upsert(&chunk(Source::Chat, "bob", 1, "b"), &[1.0])
            .await
            .unwrap();
        store
            .upsert(&chunk(Source::Mail, "c@d.e", 2, "c"), &[1.0])
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.by_source.get("chat"), Some(&2));
        assert_eq!(stats.by_source.get("mail"), Some(&1));
        assert!(stats.db_size_bytes > 0);
    }

    #[tokio::test]
    async fn metadata_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut c = chunk(Source::Mail, "a@b.c", 0, "hello");
        c.metadata = json!({"subject": "lunch"});
        let id = store.upsert(&c, &[1.0]).await.unwrap();

        let hits = store.fetch_by_ids(&[id]).await.unwrap();
        assert_eq!(hits[0].metadata["subject"], "lunch");
    }
}
