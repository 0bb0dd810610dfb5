//! Semantic retrieval and streamed answer orchestration.
//!
//! The query path embeds the question, ranks stored chunks, and merges
//! retrieval and generation into one ordered event stream: `sources`
//! first (always, even when empty), then `token`s in backend order, then
//! `done` — or a terminal `error` at whatever point something fails.
//! Multi-turn requests first rewrite the follow-up into a standalone
//! search query; reformulation degrades to the original message and never
//! fails a request.

use anyhow::{Context, Result};
use chrono::DateTime;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::embedding;
use crate::generate::Provider;
use crate::models::{ChatTurn, SearchHit, Source, SourcePreview, StreamEvent};
use crate::settings::SettingsStore;
use crate::store::Store;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Most recent history entries considered for reformulation (3 exchanges).
const REFORMULATE_HISTORY: usize = 6;
/// Per-turn content cap inside the reformulation prompt.
const REFORMULATE_TURN_CHARS: usize = 200;
/// Most recent history entries carried into chat generation (4 exchanges).
const CHAT_HISTORY: usize = 8;

const NO_MATCHES: &str = "No matching chunks found. Have you run 'ingest' yet?";

/// Embed the query and return the top-k matching chunks.
pub async fn retrieve(
    config: &Config,
    query: &str,
    top_k: usize,
    source: Option<Source>,
) -> Result<Vec<SearchHit>> {
    let query_embedding = embedding::embed_text(&config.embedding, query)
        .await
        .context("failed to embed query")?;
    let store = Store::from_config(config);
    store.search(&query_embedding, top_k, source).await
}

fn format_time(epoch_secs: f64, fmt: &str) -> String {
    DateTime::from_timestamp(epoch_secs as i64, 0)
        .map(|dt| dt.format(fmt).to_string())
        .unwrap_or_default()
}

/// Render retrieved chunks as a delimited context block for the backend.
fn format_context(hits: &[SearchHit]) -> String {
    let parts: Vec<String> = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            let header = format!(
                "[Chunk {} | {} | {} | {}\u{2013}{} | {} messages | similarity: {:.3}]",
                i + 1,
                hit.source,
                hit.contact,
                format_time(hit.start_time, "%Y-%m-%d %H:%M"),
                format_time(hit.end_time, "%H:%M"),
                hit.message_count,
                hit.similarity
            );
            format!("{}\n{}", header, hit.text)
        })
        .collect();
    parts.join("\n\n---\n\n")
}

fn build_prompt(query: &str, context: &str) -> String {
    format!(
        "You are a helpful assistant answering questions about the user's personal \
         messages. Use ONLY the conversation excerpts provided below to answer. \
         If the answer isn't in the excerpts, say so. Be concise.\n\n\
         --- CONVERSATION EXCERPTS ---\n{}\n\
         --- END EXCERPTS ---\n\n\
         Question: {}\n\n\
         Answer:",
        context, query
    )
}

fn build_system_message(context: &str) -> String {
    format!(
        "You are a helpful assistant answering questions about the user's personal \
         messages. Use ONLY the conversation excerpts provided below to answer. \
         If the answer isn't in the excerpts, say so. Be concise and specific.\n\n\
         --- CONVERSATION EXCERPTS ---\n{}\n\
         --- END EXCERPTS ---",
        context
    )
}

/// Build the reformulation prompt from the most recent turns. `None`
/// when there is no history — the message is then used verbatim.
fn build_reformulation_prompt(user_msg: &str, history: &[ChatTurn]) -> Option<String> {
    if history.is_empty() {
        return None;
    }

    let recent = &history[history.len().saturating_sub(REFORMULATE_HISTORY)..];
    let convo: Vec<String> = recent
        .iter()
        .map(|turn| {
            let speaker = if turn.role == "user" { "User" } else { "Assistant" };
            let content = match turn.content.char_indices().nth(REFORMULATE_TURN_CHARS) {
                Some((idx, _)) => &turn.content[..idx],
                None => turn.content.as_str(),
            };
            format!("{}: {}", speaker, content)
        })
        .collect();

    Some(format!(
        "Given the conversation below, rewrite the latest user message as a \
         standalone search query that captures the full intent. Output ONLY the \
         rewritten query, nothing else.\n\n\
         Conversation:\n{}\n\n\
         Latest message: {}\n\n\
         Standalone search query:",
        convo.join("\n"),
        user_msg
    ))
}

/// Rewrite a follow-up question as a standalone search query using recent
/// history. Falls back to the original message on any backend failure or
/// an empty rewrite; never raises.
pub async fn reformulate_query(
    provider: &Provider,
    model: &str,
    user_msg: &str,
    history: &[ChatTurn],
) -> String {
    let Some(prompt) = build_reformulation_prompt(user_msg, history) else {
        return user_msg.to_string();
    };

    match provider.generate(model, &prompt).await {
        Ok(rewritten) if !rewritten.is_empty() => rewritten,
        Ok(_) => user_msg.to_string(),
        Err(e) => {
            debug!(error = %e, "reformulation failed, using original message");
            user_msg.to_string()
        }
    }
}

/// Retrieve chunks and stream an answer for a single-shot question.
pub fn stream_answer(
    config: Config,
    settings: std::sync::Arc<SettingsStore>,
    query: String,
    top_k: usize,
    source: Option<Source>,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let Some(hits) = emit_sources(&tx, &config, &query, top_k, source).await else {
            return;
        };

        let effective = settings.effective();
        let provider = Provider::from_settings(&effective);
        let prompt = build_prompt(&query, &format_context(&hits));

        match provider.stream_generate(&effective.model, &prompt).await {
            Ok(tokens) => {
                if forward_tokens(&tx, tokens).await {
                    let _ = tx.send(StreamEvent::done()).await;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Generation failed: {}", e)))
                    .await;
            }
        }
    });

    rx
}

/// Multi-turn chat: reformulate → retrieve → stream an answer that also
/// sees the recent conversation history.
pub fn stream_answer_chat(
    config: Config,
    settings: std::sync::Arc<SettingsStore>,
    user_msg: String,
    history: Vec<ChatTurn>,
    top_k: usize,
    source: Option<Source>,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let effective = settings.effective();
        let provider = Provider::from_settings(&effective);

        let search_query =
            reformulate_query(&provider, &effective.model, &user_msg, &history).await;

        let Some(hits) = emit_sources(&tx, &config, &search_query, top_k, source).await else {
            return;
        };

        let mut messages = vec![ChatTurn {
            role: "system".to_string(),
            content: build_system_message(&format_context(&hits)),
        }];
        messages.extend(
            history[history.len().saturating_sub(CHAT_HISTORY)..]
                .iter()
                .cloned(),
        );
        messages.push(ChatTurn {
            role: "user".to_string(),
            content: user_msg,
        });

        match provider.stream_chat(&effective.model, &messages).await {
            Ok(tokens) => {
                if forward_tokens(&tx, tokens).await {
                    let _ = tx.send(StreamEvent::done()).await;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Generation failed: {}", e)))
                    .await;
            }
        }
    });

    rx
}

/// Run retrieval and emit the opening `sources` event. Returns the hits
/// to build context from, or `None` after emitting a terminal `error`
/// (retrieval failure or empty result). Every stream opens with
/// `sources`, even the failing ones.
async fn emit_sources(
    tx: &mpsc::Sender<StreamEvent>,
    config: &Config,
    query: &str,
    top_k: usize,
    source: Option<Source>,
) -> Option<Vec<SearchHit>> {
    let hits = match retrieve(config, query, top_k, source).await {
        Ok(hits) => hits,
        Err(e) => {
            let _ = tx.send(StreamEvent::Sources(Vec::new())).await;
            let _ = tx
                .send(StreamEvent::Error(format!("Retrieval failed: {}", e)))
                .await;
            return None;
        }
    };

    if hits.is_empty() {
        let _ = tx.send(StreamEvent::Sources(Vec::new())).await;
        let _ = tx.send(StreamEvent::Error(NO_MATCHES.to_string())).await;
        return None;
    }

    let previews = hits.iter().map(SourcePreview::from_hit).collect();
    if tx.send(StreamEvent::Sources(previews)).await.is_err() {
        return None;
    }
    Some(hits)
}

/// Forward generated tokens in arrival order. Returns `true` when the
/// token stream ended cleanly, `false` after emitting a terminal `error`
/// or losing the receiver.
async fn forward_tokens(
    tx: &mpsc::Sender<StreamEvent>,
    mut tokens: mpsc::Receiver<Result<String>>,
) -> bool {
    while let Some(item) = tokens.recv().await {
        match item {
            Ok(token) => {
                if tx.send(StreamEvent::Token(token)).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Generation failed: {}", e)))
                    .await;
                return false;
            }
        }
    }
    true
}
