//! Embedding client and vector utilities.
//!
//! Wraps the backend's embed capability with the retry policy ingestion
//! needs: transient server errors (HTTP 5xx) are retried with a linearly
//! increasing backoff and a bounded attempt count; anything else —
//! client errors, unreachable service — fails immediately and the caller
//! decides whether to skip the chunk or abort.
//!
//! Also provides the vector helpers shared with the store:
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for
//!   SQLite BLOB storage
//! - [`blob_to_vec`] — decode a SQLite BLOB back into a `Vec<f32>`
//! - [`cosine_similarity`] — compare two embedding vectors

use anyhow::Result;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::generate::Provider;

/// Upper bound on embedded text length, in characters. The embedding
/// model's context window fits roughly this much at ~4 chars per token.
const MAX_CHARS: usize = 30_000;

/// Object-replacement character the chat archive inserts for attachments.
const ATTACHMENT_PLACEHOLDER: char = '\u{FFFC}';

/// Strip characters the embedding service chokes on and cap the length
/// on a character boundary.
fn clean(text: &str) -> String {
    let cleaned: String = text.chars().filter(|c| *c != ATTACHMENT_PLACEHOLDER).collect();
    match cleaned.char_indices().nth(MAX_CHARS) {
        Some((idx, _)) => cleaned[..idx].to_string(),
        None => cleaned,
    }
}

/// Embed a single text via the local inference service, retrying
/// transient server errors.
///
/// Backoff is linear: 1s after the first failure, 2s after the second,
/// and so on, up to `max_retries` retries.
pub async fn embed_text(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let text = clean(text);
    let provider = Provider::Ollama {
        url: config.url.clone(),
    };

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        }

        match provider.embed(&config.model, std::slice::from_ref(&text)).await {
            Ok(mut vectors) => {
                return vectors
                    .pop()
                    .ok_or_else(|| anyhow::anyhow!("empty embedding response"));
            }
            Err(e) if is_transient(&e) => {
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding failed after retries")))
}

/// A failure is worth retrying only when the service answered with a
/// server error. Client errors and an unreachable service fail fast.
fn is_transient(e: &anyhow::Error) -> bool {
    e.downcast_ref::<reqwest::Error>()
        .and_then(|re| re.status())
        .map(|status| status.is_server_error())
        .unwrap_or(false)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing a
/// BLOB of `vec.len() × 4` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, or a zero-norm operand — never divides by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 2.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn clean_strips_placeholders_and_caps() {
        let text = format!("photo\u{FFFC} of the dog{}", "x".repeat(40_000));
        let cleaned = clean(&text);
        assert!(!cleaned.contains('\u{FFFC}'));
        assert!(cleaned.starts_with("photo of the dog"));
        assert_eq!(cleaned.chars().count(), MAX_CHARS);
    }

    #[test]
    fn plain_errors_are_not_transient() {
        assert!(!is_transient(&anyhow::anyhow!("no service here")));
    }
}
