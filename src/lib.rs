//! # Recall
//!
//! A local-first retrieval-augmented search engine over personal message
//! archives (chat history and mail).
//!
//! Everything runs offline against local data: archives are decoded in a
//! streaming fashion, grouped into conversation-sized chunks, embedded via
//! a local inference service, and stored in a single SQLite file. Queries
//! embed the question, rank stored chunks by cosine similarity with an
//! exhaustive scan (a personal archive is small enough that no index is
//! worth maintaining), and stream a generated answer grounded in the
//! retrieved excerpts.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────┐
//! │ Decoders  │──▶│   Pipeline   │──▶│  SQLite   │
//! │ chat/mail │   │ chunk+embed  │   │  vectors  │
//! └───────────┘   └──────────────┘   └─────┬─────┘
//!                                          │
//!                      ┌───────────────────┤
//!                      ▼                   ▼
//!                 ┌──────────┐       ┌──────────┐
//!                 │   CLI    │       │   HTTP   │
//!                 │ (recall) │       │ (axum)   │
//!                 └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`settings`] | Mutable generation settings with env fallback |
//! | [`models`] | Core data types |
//! | [`chat`] | Chat archive decoder (SQLite store, blob text fallback) |
//! | [`mail`] | Mail archive decoder (.mbox folders of .emlx files) |
//! | [`chunker`] | Conversation-window and per-message chunking |
//! | [`embedding`] | Embedding client and vector utilities |
//! | [`generate`] | Generation backend abstraction |
//! | [`store`] | SQLite vector store with brute-force search |
//! | [`ingest`] | Decode → chunk → embed → store pipeline |
//! | [`progress`] | CLI ingest progress reporting |
//! | [`tasks`] | Background ingestion tasks with cooperative cancel |
//! | [`query`] | Retrieval and streamed answer orchestration |
//! | [`server`] | JSON/SSE HTTP API |

pub mod chat;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod generate;
pub mod ingest;
pub mod mail;
pub mod models;
pub mod progress;
pub mod query;
pub mod server;
pub mod settings;
pub mod store;
pub mod tasks;
