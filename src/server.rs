//! HTTP API server.
//!
//! Exposes the query, ingest, status, and settings surfaces as a JSON API
//! with server-sent-event streaming for answers. The routing layer stays
//! thin: it validates parameters, delegates to the task registry /
//! retrieval engine / settings store, and maps failures to the error
//! contract below. It never reaches into decoder or chunker internals.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/query/stream` | Stream a single-shot answer (SSE) |
//! | `POST` | `/api/chat/stream` | Stream a multi-turn answer (SSE) |
//! | `GET`  | `/api/query/retrieve` | Raw ranked chunks (JSON) |
//! | `GET`  | `/api/chunk/{id}` | Full chunk by row id |
//! | `POST` | `/api/ingest/start` | Launch a background ingest |
//! | `GET`  | `/api/ingest/tasks` | All tasks, newest first |
//! | `GET`  | `/api/ingest/tasks/{id}` | One task |
//! | `POST` | `/api/ingest/cancel/{id}` | Request cooperative cancel |
//! | `GET`  | `/api/status` | Store stats + backend health |
//! | `GET`  | `/api/settings` | Effective generation settings |
//! | `PUT`  | `/api/settings` | Update generation settings |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown source 'x'" } }
//! ```
//!
//! # SSE framing
//!
//! Each answer event is one JSON object on a single `data:` line:
//! `data: {"type": "token", "data": "..."}`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::models::{ChatTurn, Source, StreamEvent};
use crate::query::{retrieve, stream_answer, stream_answer_chat};
use crate::settings::{SavedSettings, SettingsStore};
use crate::store::Store;
use crate::tasks::{TaskRegistry, TaskSnapshot};

const DEFAULT_TOP_K: usize = 5;
const HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Config,
    settings: Arc<SettingsStore>,
    tasks: Arc<TaskRegistry>,
}

/// Start the API server on the configured bind address.
pub async fn run_server(
    config: Config,
    settings: Arc<SettingsStore>,
    tasks: Arc<TaskRegistry>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let bind_addr = format!(
        "{}:{}",
        config.server.bind,
        port.unwrap_or(config.server.port)
    );

    let state = AppState {
        config,
        settings,
        tasks,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/query/stream", get(handle_query_stream))
        .route("/api/chat/stream", post(handle_chat_stream))
        .route("/api/query/retrieve", get(handle_retrieve))
        .route("/api/chunk/{id}", get(handle_chunk_detail))
        .route("/api/ingest/start", post(handle_ingest_start))
        .route("/api/ingest/tasks", get(handle_ingest_tasks))
        .route("/api/ingest/tasks/{id}", get(handle_ingest_task))
        .route("/api/ingest/cancel/{id}", post(handle_ingest_cancel))
        .route("/api/status", get(handle_status))
        .route(
            "/api/settings",
            get(handle_get_settings).put(handle_put_settings),
        )
        .layer(cors)
        .with_state(state);

    println!("recall server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// An empty source string means "no filter"; anything else must parse.
fn parse_source(source: Option<String>) -> Result<Option<Source>, AppError> {
    match source.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|e: anyhow::Error| bad_request(e.to_string())),
    }
}

// ============ Answer streaming ============

fn sse_from_events(
    rx: mpsc::Receiver<StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let frame = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok::<_, Infallible>(frame), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct QueryStreamParams {
    q: String,
    top_k: Option<usize>,
    source: Option<String>,
}

async fn handle_query_stream(
    State(state): State<AppState>,
    Query(params): Query<QueryStreamParams>,
) -> Result<impl IntoResponse, AppError> {
    let source = parse_source(params.source)?;
    let rx = stream_answer(
        state.config.clone(),
        state.settings.clone(),
        params.q,
        params.top_k.unwrap_or(DEFAULT_TOP_K),
        source,
    );
    Ok(sse_from_events(rx))
}

#[derive(Deserialize)]
struct ChatStreamRequest {
    query: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    source: Option<String>,
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatStreamRequest>,
) -> Result<impl IntoResponse, AppError> {
    let source = parse_source(req.source)?;
    let rx = stream_answer_chat(
        state.config.clone(),
        state.settings.clone(),
        req.query,
        req.history,
        req.top_k.unwrap_or(DEFAULT_TOP_K),
        source,
    );
    Ok(sse_from_events(rx))
}

// ============ Retrieval ============

async fn handle_retrieve(
    State(state): State<AppState>,
    Query(params): Query<QueryStreamParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let source = parse_source(params.source)?;
    let results = retrieve(
        &state.config,
        &params.q,
        params.top_k.unwrap_or(DEFAULT_TOP_K),
        source,
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    Ok(Json(serde_json::json!({ "results": results })))
}

async fn handle_chunk_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = Store::from_config(&state.config);
    let hits = store
        .fetch_by_ids(&[id])
        .await
        .map_err(|e| internal(e.to_string()))?;

    match hits.into_iter().next() {
        Some(hit) => Ok(Json(serde_json::to_value(hit).unwrap_or_default())),
        None => Err(not_found(format!("no chunk with id {}", id))),
    }
}

// ============ Ingest tasks ============

#[derive(Deserialize)]
struct IngestStartRequest {
    source: String,
    #[serde(default)]
    since: Option<String>,
}

async fn handle_ingest_start(
    State(state): State<AppState>,
    Json(req): Json<IngestStartRequest>,
) -> Result<Json<TaskSnapshot>, AppError> {
    let source: Source = req
        .source
        .parse()
        .map_err(|e: anyhow::Error| bad_request(e.to_string()))?;

    let since = req.since.filter(|s| !s.trim().is_empty());

    let task = state
        .tasks
        .start(source, since)
        .map_err(|e| conflict(e.to_string()))?;

    Ok(Json(task.snapshot()))
}

async fn handle_ingest_tasks(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tasks": state.tasks.all() }))
}

async fn handle_ingest_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, AppError> {
    state
        .tasks
        .get(&id)
        .map(|t| Json(t.snapshot()))
        .ok_or_else(|| not_found(format!("no task with id {}", id)))
}

async fn handle_ingest_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, AppError> {
    let task = state
        .tasks
        .get(&id)
        .ok_or_else(|| not_found(format!("no task with id {}", id)))?;
    task.request_cancel();
    Ok(Json(task.snapshot()))
}

// ============ Status ============

async fn handle_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let store = Store::from_config(&state.config);
    let stats = store.stats().await.map_err(|e| internal(e.to_string()))?;

    let embedding = check_embedding_service(&state.config).await;
    let generation = check_generation_backend(&state.settings).await;

    Ok(Json(serde_json::json!({
        "stats": stats,
        "embedding": embedding,
        "generation": generation,
    })))
}

/// Probe the local inference service and report whether the embedding
/// model is available.
async fn check_embedding_service(config: &Config) -> serde_json::Value {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(HEALTH_PROBE_TIMEOUT_SECS))
        .build()
    {
        Ok(client) => client,
        Err(e) => return serde_json::json!({"status": "offline", "error": e.to_string()}),
    };

    let url = format!("{}/api/tags", config.embedding.url);
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let models: Vec<String> = body
                .get("models")
                .and_then(|m| m.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            let has_embed = models.iter().any(|m| m.contains(&config.embedding.model));
            serde_json::json!({
                "status": "online",
                "models": models,
                "has_embed": has_embed,
            })
        }
        Ok(resp) => serde_json::json!({"status": "offline", "error": resp.status().to_string()}),
        Err(e) => serde_json::json!({"status": "offline", "error": e.to_string()}),
    }
}

/// Probe the configured generation backend.
async fn check_generation_backend(settings: &SettingsStore) -> serde_json::Value {
    let effective = settings.effective();

    if effective.backend != "openai" {
        return serde_json::json!({
            "backend": effective.backend,
            "model": effective.model,
            "status": "via_local_service",
        });
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(HEALTH_PROBE_TIMEOUT_SECS))
        .build()
    {
        Ok(client) => client,
        Err(e) => return serde_json::json!({"status": "offline", "error": e.to_string()}),
    };

    let url = format!("{}/models", effective.api_url.trim_end_matches('/'));
    let status = match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => serde_json::json!("online"),
        Ok(resp) => {
            return serde_json::json!({
                "backend": "openai",
                "model": effective.model,
                "status": "offline",
                "error": resp.status().to_string(),
            })
        }
        Err(e) => {
            return serde_json::json!({
                "backend": "openai",
                "model": effective.model,
                "status": "offline",
                "error": e.to_string(),
            })
        }
    };

    serde_json::json!({
        "backend": "openai",
        "model": effective.model,
        "status": status,
    })
}

// ============ Settings ============

/// Effective settings with the API key masked for display.
fn redacted_settings(settings: &SettingsStore) -> serde_json::Value {
    let effective = settings.effective();
    serde_json::json!({
        "generation_backend": effective.backend,
        "generation_model": effective.model,
        "generation_api_url": effective.api_url,
        "generation_api_key_set": !effective.api_key.is_empty(),
    })
}

async fn handle_get_settings(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(redacted_settings(&state.settings))
}

async fn handle_put_settings(
    State(state): State<AppState>,
    Json(update): Json<SavedSettings>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .settings
        .save(update)
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(redacted_settings(&state.settings)))
}
