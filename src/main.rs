//! # Recall CLI
//!
//! The `recall` binary is the primary interface: ingest archives into the
//! vector store, query them with natural language, inspect store stats,
//! and run the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! recall ingest --source chat --since 30d
//! recall ingest --source mail
//! recall query "what did we decide about rent?"
//! recall query "trips we planned" --source chat --top-k 10 --retrieve-only
//! recall status
//! recall serve --port 5391
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use recall::config::{self, Config};
use recall::ingest::{self, PipelineOutcome};
use recall::models::{Source, StreamEvent};
use recall::progress::ProgressMode;
use recall::query::{retrieve, stream_answer};
use recall::server;
use recall::settings::SettingsStore;
use recall::store::Store;
use recall::tasks::TaskRegistry;

/// Local semantic search over personal chat and mail archives.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file; with no file present, built-in defaults are used.
#[derive(Parser)]
#[command(
    name = "recall",
    about = "Local semantic search over personal chat and mail archives",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults to ~/.recall/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest an archive into the vector store.
    ///
    /// Streams records from the archive, groups them into chunks, embeds
    /// each chunk, and upserts it. Re-running is safe: unchanged chunks
    /// are updated in place, never duplicated.
    Ingest {
        /// Data source to ingest: `chat` or `mail`.
        #[arg(long)]
        source: String,

        /// Only ingest messages from this far back (e.g. 30d, 24h).
        #[arg(long)]
        since: Option<String>,
    },

    /// Search your messages with natural language.
    Query {
        /// Your question or search query.
        question: String,

        /// Restrict search to a specific source: `chat` or `mail`.
        #[arg(long)]
        source: Option<String>,

        /// Number of chunks to retrieve.
        #[arg(long, default_value_t = 5)]
        top_k: usize,

        /// Show raw retrieved chunks without generating an answer.
        #[arg(long)]
        retrieve_only: bool,
    },

    /// Show vector store statistics.
    Status,

    /// Start the HTTP server.
    Serve {
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let cfg = config::load_config(&config_path)?;

    match cli.command {
        Commands::Ingest { source, since } => {
            run_ingest(&cfg, &source, since).await?;
        }
        Commands::Query {
            question,
            source,
            top_k,
            retrieve_only,
        } => {
            let source = source.map(|s| s.parse::<Source>()).transpose()?;
            if retrieve_only {
                run_retrieve_only(&cfg, &question, top_k, source).await?;
            } else {
                run_query(&cfg, question, top_k, source).await;
            }
        }
        Commands::Status => {
            run_status(&cfg).await?;
        }
        Commands::Serve { port } => {
            let settings = Arc::new(SettingsStore::new(
                cfg.settings_path(),
                cfg.generation.clone(),
            ));
            let tasks = Arc::new(TaskRegistry::new(cfg.clone()));
            server::run_server(cfg, settings, tasks, port).await?;
        }
    }

    Ok(())
}

async fn run_ingest(cfg: &Config, source: &str, since: Option<String>) -> anyhow::Result<()> {
    let source: Source = source.parse()?;
    let since = since.map(|s| ingest::parse_since(&s)).transpose()?;

    let since_display = since
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "all time".to_string());
    println!("Ingesting {} since {}...", source, since_display);

    let observer = ProgressMode::default_for_tty().observer();
    let cancel = AtomicBool::new(false);
    let start = std::time::Instant::now();

    let summary = ingest::run_pipeline(cfg, source, since, observer.as_ref(), &cancel).await?;

    let elapsed = start.elapsed().as_secs_f64();
    match summary.outcome {
        PipelineOutcome::Completed => {
            println!(
                "\nDone. {} chunks from {} messages in {:.1}s",
                summary.chunks_stored, summary.messages_stored, elapsed
            );
            if summary.chunks_skipped > 0 {
                println!("  skipped {} chunks (embedding failures)", summary.chunks_skipped);
            }
        }
        PipelineOutcome::Cancelled => {
            println!("\nCancelled after {} chunks", summary.chunks_stored);
        }
    }

    Ok(())
}

async fn run_retrieve_only(
    cfg: &Config,
    question: &str,
    top_k: usize,
    source: Option<Source>,
) -> anyhow::Result<()> {
    let results = retrieve(cfg, question, top_k, source).await?;
    if results.is_empty() {
        println!("No matching chunks found.");
        return Ok(());
    }

    for (i, hit) in results.iter().enumerate() {
        let start = chrono::DateTime::from_timestamp(hit.start_time as i64, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("\n--- Result {} (similarity: {:.3}) ---", i + 1, hit.similarity);
        println!(
            "Contact: {}  |  {}  |  {} msgs",
            hit.contact, start, hit.message_count
        );
        let excerpt: String = hit.text.chars().take(500).collect();
        println!("{}", excerpt);
    }

    Ok(())
}

async fn run_query(cfg: &Config, question: String, top_k: usize, source: Option<Source>) {
    use std::io::Write;

    let settings = Arc::new(SettingsStore::new(
        cfg.settings_path(),
        cfg.generation.clone(),
    ));

    let mut events = stream_answer(cfg.clone(), settings, question, top_k, source);

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Sources(previews) => {
                if previews.is_empty() {
                    // The terminal error event carries the explanation.
                    continue;
                }
                let mut contacts: Vec<&str> =
                    previews.iter().map(|p| p.contact.as_str()).collect();
                contacts.sort_unstable();
                contacts.dedup();
                println!(
                    "Found {} relevant chunks from: {}",
                    previews.len(),
                    contacts.join(", ")
                );
                println!();
            }
            StreamEvent::Token(token) => {
                print!("{}", token);
                let _ = std::io::stdout().flush();
            }
            StreamEvent::Error(message) => {
                println!("{}", message);
                return;
            }
            StreamEvent::Done(_) => {
                println!();
            }
        }
    }
}

async fn run_status(cfg: &Config) -> anyhow::Result<()> {
    let store = Store::from_config(cfg);
    let stats = store.stats().await?;

    if stats.total_chunks == 0 {
        println!("Vector store is empty. Run 'ingest' first.");
        return Ok(());
    }

    println!("Total chunks: {}", stats.total_chunks);
    for (source, count) in &stats.by_source {
        println!("  {}: {}", source, count);
    }
    println!(
        "Store size: {:.2} MB",
        stats.db_size_bytes as f64 / (1024.0 * 1024.0)
    );

    Ok(())
}
