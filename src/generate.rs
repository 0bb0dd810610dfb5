//! Generation backend abstraction.
//!
//! A [`Provider`] is one of two interchangeable backends selected from
//! settings at call time: the local inference service (line-delimited
//! JSON token events) or an OpenAI-compatible service (SSE token deltas
//! with a `[DONE]` sentinel). Both expose the same capability set —
//! embed, one-shot generation, streaming generation, and streaming chat.
//!
//! Streaming calls return a bounded channel of token fragments. Tokens
//! are forwarded in arrival order with no buffering beyond reassembling
//! wire lines that straddle network reads; a stream error is delivered
//! in-band as the final item.

use anyhow::{bail, Result};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::models::ChatTurn;
use crate::settings::EffectiveSettings;

/// One-shot generation and reformulation calls are short.
const GENERATE_TIMEOUT_SECS: u64 = 30;
/// Streaming generation can legitimately run for minutes.
const STREAM_TIMEOUT_SECS: u64 = 300;
const EMBED_TIMEOUT_SECS: u64 = 120;

const TOKEN_CHANNEL_CAPACITY: usize = 32;

pub type TokenStream = mpsc::Receiver<Result<String>>;

/// A generation backend plus the model it should use.
#[derive(Debug, Clone)]
pub enum Provider {
    Ollama { url: String },
    OpenAi { url: String, api_key: String },
}

impl Provider {
    /// Select the backend from the effective settings. Anything that is
    /// not explicitly OpenAI-compatible routes to the local service.
    pub fn from_settings(settings: &EffectiveSettings) -> Self {
        if settings.backend == "openai" {
            Provider::OpenAi {
                url: settings.api_url.trim_end_matches('/').to_string(),
                api_key: settings.api_key.clone(),
            }
        } else {
            Provider::Ollama {
                url: settings.ollama_url.trim_end_matches('/').to_string(),
            }
        }
    }

    fn client(timeout_secs: u64) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?)
    }

    /// Embed a batch of texts. Returns one vector per input, in order.
    pub async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = Self::client(EMBED_TIMEOUT_SECS)?;
        match self {
            Provider::Ollama { url } => {
                // The local service embeds one prompt per call.
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    let resp = client
                        .post(format!("{}/api/embeddings", url))
                        .json(&json!({"model": model, "prompt": text}))
                        .send()
                        .await?
                        .error_for_status()?;
                    let body: Value = resp.json().await?;
                    let values = body
                        .get("embedding")
                        .and_then(|e| e.as_array())
                        .ok_or_else(|| anyhow::anyhow!("missing embedding in response"))?;
                    out.push(
                        values
                            .iter()
                            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                            .collect(),
                    );
                }
                Ok(out)
            }
            Provider::OpenAi { url, api_key } => {
                let resp = apply_auth(
                    client.post(format!("{}/embeddings", url)),
                    api_key,
                )
                .json(&json!({"model": model, "input": texts}))
                .send()
                .await?
                .error_for_status()?;
                let body: Value = resp.json().await?;
                let data = body
                    .get("data")
                    .and_then(|d| d.as_array())
                    .ok_or_else(|| anyhow::anyhow!("missing data in embeddings response"))?;
                data.iter()
                    .map(|item| {
                        item.get("embedding")
                            .and_then(|e| e.as_array())
                            .map(|values| {
                                values
                                    .iter()
                                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                                    .collect()
                            })
                            .ok_or_else(|| anyhow::anyhow!("missing embedding in response"))
                    })
                    .collect()
            }
        }
    }

    /// Single non-streaming generation. The OpenAI-compatible path
    /// accumulates streamed tokens, since some compatible servers only
    /// stream.
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        match self {
            Provider::Ollama { url } => {
                let client = Self::client(GENERATE_TIMEOUT_SECS)?;
                let resp = client
                    .post(format!("{}/api/generate", url))
                    .json(&json!({"model": model, "prompt": prompt, "stream": false}))
                    .send()
                    .await?
                    .error_for_status()?;
                let body: Value = resp.json().await?;
                Ok(body
                    .get("response")
                    .and_then(|r| r.as_str())
                    .unwrap_or_default()
                    .trim()
                    .to_string())
            }
            Provider::OpenAi { .. } => {
                let messages = vec![ChatTurn {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                }];
                let mut rx = self.stream_chat(model, &messages).await?;
                let mut out = String::new();
                while let Some(token) = rx.recv().await {
                    out.push_str(&token?);
                }
                Ok(out.trim().to_string())
            }
        }
    }

    /// Stream tokens for a single prompt.
    pub async fn stream_generate(&self, model: &str, prompt: &str) -> Result<TokenStream> {
        match self {
            Provider::Ollama { url } => {
                let body = json!({"model": model, "prompt": prompt, "stream": true});
                self.stream_ollama(&format!("{}/api/generate", url), body, TokenField::Response)
                    .await
            }
            Provider::OpenAi { .. } => {
                let messages = vec![ChatTurn {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                }];
                self.stream_chat(model, &messages).await
            }
        }
    }

    /// Stream tokens for a chat completion over a messages array.
    pub async fn stream_chat(&self, model: &str, messages: &[ChatTurn]) -> Result<TokenStream> {
        match self {
            Provider::Ollama { url } => {
                let body = json!({"model": model, "messages": messages, "stream": true});
                self.stream_ollama(&format!("{}/api/chat", url), body, TokenField::MessageContent)
                    .await
            }
            Provider::OpenAi { url, api_key } => {
                let client = Self::client(STREAM_TIMEOUT_SECS)?;
                let response = apply_auth(
                    client.post(format!("{}/chat/completions", url)),
                    api_key,
                )
                .json(&json!({"model": model, "messages": messages, "stream": true}))
                .send()
                .await?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    bail!("generation request failed {}: {}", status, text);
                }

                let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
                tokio::spawn(forward_sse_stream(response, tx));
                Ok(rx)
            }
        }
    }

    async fn stream_ollama(&self, url: &str, body: Value, field: TokenField) -> Result<TokenStream> {
        let client = Self::client(STREAM_TIMEOUT_SECS)?;
        let response = client.post(url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("generation request failed {}: {}", status, text);
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(forward_ollama_stream(response, tx, field));
        Ok(rx)
    }
}

fn apply_auth(req: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        req
    } else {
        req.header("Authorization", format!("Bearer {}", api_key))
    }
}

/// Where the token text lives in a local-service stream object.
#[derive(Clone, Copy)]
enum TokenField {
    /// `/api/generate`: `{"response": "...", "done": false}`
    Response,
    /// `/api/chat`: `{"message": {"content": "..."}, "done": false}`
    MessageContent,
}

/// Forward a line-delimited JSON token stream. Network reads do not align
/// with line boundaries, so a carry buffer reassembles partial lines.
async fn forward_ollama_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<String>>,
    field: TokenField,
) {
    let mut stream = response.bytes_stream();
    let mut carry = String::new();

    while let Some(item) = stream.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };
        carry.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = carry.find('\n') {
            let line: String = carry.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Ok(data) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let token = match field {
                TokenField::Response => data.get("response").and_then(|t| t.as_str()),
                TokenField::MessageContent => data
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|t| t.as_str()),
            };
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                if tx.send(Ok(token.to_string())).await.is_err() {
                    return;
                }
            }
            if data.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                return;
            }
        }
    }
}

/// Forward an SSE token stream: `data:`-prefixed JSON lines terminated by
/// the `[DONE]` sentinel, token text in `choices[0].delta.content`.
async fn forward_sse_stream(response: reqwest::Response, tx: mpsc::Sender<Result<String>>) {
    let mut stream = response.bytes_stream();
    let mut carry = String::new();

    while let Some(item) = stream.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };
        carry.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = carry.find('\n') {
            let line: String = carry.drain(..=newline).collect();
            let line = line.trim();
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            if payload.trim() == "[DONE]" {
                return;
            }

            let Ok(data) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            let token = data["choices"][0]["delta"]["content"].as_str();
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                if tx.send(Ok(token.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }
}
