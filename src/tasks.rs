//! Background task management for long-running ingestions.
//!
//! The registry owns every task for the life of the process and is shared
//! via `Arc`. A single coarse lock guards the task map and each task's
//! mutable state; it is held only for the brief critical sections that
//! read or write status and counters, never across I/O.
//!
//! Cancellation is a flag the worker polls between chunks — setting it
//! never blocks and never interrupts a network call already in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::ingest::{self, PipelineOutcome};
use crate::models::Source;
use crate::progress::IngestObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Cancelled,
    Failed,
}

impl TaskStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    chunks_processed: u64,
    messages_processed: u64,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// One ingestion job. Mutable state lives behind the lock; the cancel
/// flag is atomic so it can be set without contention.
pub struct IngestTask {
    pub id: String,
    pub source: Source,
    pub since: Option<String>,
    state: Mutex<TaskState>,
    cancel_requested: AtomicBool,
}

/// Serializable read-only view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub source: Source,
    pub since: Option<String>,
    pub status: TaskStatus,
    pub chunks_processed: u64,
    pub messages_processed: u64,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

impl IngestTask {
    fn new(source: Source, since: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            source,
            since,
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                chunks_processed: 0,
                messages_processed: 0,
                error: None,
                started_at: None,
                finished_at: None,
            }),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Ask the worker to stop. Only sets a flag; the worker observes it
    /// at its next between-chunks checkpoint.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Relaxed);
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().expect("task lock").status
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock().expect("task lock");
        TaskSnapshot {
            id: self.id.clone(),
            source: self.source,
            since: self.since.clone(),
            status: state.status,
            chunks_processed: state.chunks_processed,
            messages_processed: state.messages_processed,
            error: state.error.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            cancel_requested: self.cancel_requested.load(Ordering::Relaxed),
        }
    }

    fn mark_running(&self) {
        let mut state = self.state.lock().expect("task lock");
        state.status = TaskStatus::Running;
        state.started_at = Some(Utc::now());
    }

    /// Statuses only move forward; a terminal state is never overwritten.
    fn finish(&self, status: TaskStatus, error: Option<String>) {
        let mut state = self.state.lock().expect("task lock");
        if state.status.is_terminal() {
            return;
        }
        state.status = status;
        state.error = error;
        state.finished_at = Some(Utc::now());
    }
}

/// Observer that mirrors pipeline totals into the task counters.
struct TaskObserver {
    task: Arc<IngestTask>,
}

impl IngestObserver for TaskObserver {
    fn on_chunk(&self, _source: Source, chunks: u64, messages: u64) {
        let mut state = self.task.state.lock().expect("task lock");
        state.chunks_processed = chunks;
        state.messages_processed = messages;
    }
}

/// Process-local registry owning all ingestion tasks.
pub struct TaskRegistry {
    config: Config,
    tasks: Mutex<HashMap<String, Arc<IngestTask>>>,
}

impl TaskRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<IngestTask>> {
        self.tasks.lock().expect("registry lock").get(task_id).cloned()
    }

    /// Snapshot of all tasks, newest first.
    pub fn all(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .tasks
            .lock()
            .expect("registry lock")
            .values()
            .map(|t| t.snapshot())
            .collect();
        snapshots.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub fn has_active(&self, source: Source) -> bool {
        self.tasks
            .lock()
            .expect("registry lock")
            .values()
            .any(|t| t.source == source && !t.status().is_terminal())
    }

    /// Create a task and launch its worker. Rejects when a task for the
    /// same source is already pending or running; the check and the
    /// insert happen under one lock acquisition, so two concurrent starts
    /// for one source cannot both win.
    pub fn start(&self, source: Source, since: Option<String>) -> Result<Arc<IngestTask>> {
        let task = {
            let mut tasks = self.tasks.lock().expect("registry lock");
            if tasks
                .values()
                .any(|t| t.source == source && !t.status().is_terminal())
            {
                bail!("an ingest for '{}' is already running", source);
            }
            let task = Arc::new(IngestTask::new(source, since));
            tasks.insert(task.id.clone(), task.clone());
            task
        };

        tokio::spawn(run_worker(self.config.clone(), task.clone()));

        Ok(task)
    }
}

async fn run_worker(config: Config, task: Arc<IngestTask>) {
    task.mark_running();
    info!(id = %task.id, source = %task.source, "ingest task started");

    let since = match &task.since {
        Some(value) => match ingest::parse_since(value) {
            Ok(dt) => Some(dt),
            Err(e) => {
                task.finish(TaskStatus::Failed, Some(e.to_string()));
                return;
            }
        },
        None => None,
    };

    let observer = TaskObserver { task: task.clone() };
    let result = ingest::run_pipeline(
        &config,
        task.source,
        since,
        &observer,
        &task.cancel_requested,
    )
    .await;

    match result {
        Ok(summary) => {
            let status = match summary.outcome {
                PipelineOutcome::Completed => TaskStatus::Done,
                PipelineOutcome::Cancelled => TaskStatus::Cancelled,
            };
            info!(
                id = %task.id,
                chunks = summary.chunks_stored,
                skipped = summary.chunks_skipped,
                "ingest task finished"
            );
            task.finish(status, None);
        }
        Err(e) => {
            error!(id = %task.id, error = %e, "ingest task failed");
            task.finish(TaskStatus::Failed, Some(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Arc<TaskRegistry> {
        let mut config = Config::default();
        config.db.path = dir.path().join("vectors.db");
        // Point the archives somewhere that does not exist so workers
        // finish quickly without touching real data.
        config.archives.chat_db = dir.path().join("missing-chat.db");
        config.archives.mail_dir = dir.path().join("missing-mail");
        Arc::new(TaskRegistry::new(config))
    }

    #[tokio::test]
    async fn rejects_duplicate_source() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let first = registry.start(Source::Chat, None).unwrap();
        // The first task is pending or running; a second start for the
        // same source must be rejected while the other source is free.
        assert!(registry.start(Source::Chat, None).is_err() || first.status().is_terminal());
        assert!(registry.start(Source::Mail, None).is_ok());
    }

    #[tokio::test]
    async fn missing_archive_fails_task() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let task = registry.start(Source::Chat, None).unwrap();
        for _ in 0..200 {
            if task.status().is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot.error.is_some());
        assert_eq!(snapshot.chunks_processed, 0);
    }

    #[tokio::test]
    async fn mail_task_on_empty_dir_completes() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        std::fs::create_dir_all(dir.path().join("missing-mail")).unwrap();

        let task = registry.start(Source::Mail, None).unwrap();
        for _ in 0..200 {
            if task.status().is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(task.status(), TaskStatus::Done);
    }

    #[tokio::test]
    async fn cancel_only_sets_flag() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let task = registry.start(Source::Mail, Some("7d".to_string())).unwrap();
        task.request_cancel();
        assert!(task.snapshot().cancel_requested);
    }

    #[tokio::test]
    async fn bad_since_fails_task() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let task = registry.start(Source::Mail, Some("7w".to_string())).unwrap();
        for _ in 0..200 {
            if task.status().is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot.error.unwrap().contains("unknown time unit"));
    }
}
