//! # novel-tasks
//!
//! Durable background task scheduler for a novel-reading application.
//!
//! ## Design Philosophy
//!
//! novel-tasks is designed to be:
//! - **Crash-resumable** - The queue is persisted and picked up by the next process
//! - **Polite to sources** - Per-plugin concurrency ceilings and start spacing
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! Background work (library updates, chapter downloads, backups, imports,
//! tracker syncs, text-to-speech) is queued as [`Task`] values. One cooperative
//! loop runs foreground tasks one at a time, ahead of any download, and
//! keeps a bounded number of chapter downloads in flight next to it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use novel_tasks::{
//!     Collaborators, Config, Database, PluginRegistry, Services, StandardExecutors, Task,
//!     TaskScheduler, TracingSink, UpdateLibraryData,
//! };
//! use novel_tasks::executors::{SpeechEngine, TrackerClient};
//! use novel_tasks::library::Library;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     library: Arc<dyn Library>,
//! #     trackers: Arc<dyn TrackerClient>,
//! #     speech: Arc<dyn SpeechEngine>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let db = Arc::new(Database::new(&config.persistence.database_path).await?);
//!
//! let services = Services {
//!     library: library.clone(),
//!     plugins: Arc::new(PluginRegistry::new()),
//!     trackers,
//!     speech,
//! };
//! let executors = StandardExecutors::new(
//!     services,
//!     config.retry.clone(),
//!     config.download.download_new_chapters,
//! );
//!
//! let scheduler = TaskScheduler::new(
//!     config,
//!     Collaborators {
//!         kv: db,
//!         library,
//!         executors: Arc::new(executors),
//!         sink: Arc::new(TracingSink),
//!         network: None,
//!     },
//! )
//! .await?;
//!
//! // Subscribe to events
//! let mut events = scheduler.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! // Resume whatever the previous process left behind, then add work
//! scheduler.start();
//! scheduler
//!     .add_task(Task::UpdateLibrary(UpdateLibraryData::default()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Download policy: novel expansion and start gating
pub mod coordinator;
/// Persistence layer
pub mod db;
/// Error types
pub mod error;
/// Task execution strategies
pub mod executors;
/// Library store collaborator
pub mod library;
/// Progress notifications
pub mod notification;
/// Source plugin capability
pub mod plugin;
/// Retry logic with exponential backoff
pub mod retry;
/// The background task scheduler
pub mod scheduler;
/// Durable write-behind task queue
pub mod task_store;
/// Core types and events
pub mod types;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use config::{
    Config, DownloadConfig, NotificationConfig, PersistenceConfig, RetryConfig, SchedulerConfig,
};
pub use coordinator::{BlockReason, DownloadCoordinator, DownloadOutcome, StartDecision};
pub use db::{Database, KeyValueStore, MemoryStore};
pub use error::{DatabaseError, Error, Result};
pub use executors::{ExecutionContext, Executors, Services, StandardExecutors};
pub use notification::{Notification, NotificationAction, NotificationSink, TracingSink};
pub use plugin::{Plugin, PluginRegistry};
pub use scheduler::{Collaborators, TaskScheduler};
pub use task_store::{Subscription, TaskStore};
pub use types::{
    BackupData, ChapterId, ConnectionType, DownloadChapterData, DownloadMode, DownloadNovelData,
    Event, ImportEpubData, ImportSource, MassImportData, MassImportItem, MigrateNovelData,
    NovelId, QueuedTask, RestoreData, RunSummary, SchedulerState, SyncDirection, Task, TaskId,
    TaskKind, TaskMetadata, TaskOutput, TrackerSyncData, TtsData, UpdateLibraryData,
};

/// Helper function to run the scheduler with graceful signal handling.
///
/// Waits for a termination signal and then calls the scheduler's `shutdown()` method,
/// which lets in-flight downloads finish and persists the queue for the next run.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use novel_tasks::{TaskScheduler, run_with_shutdown};
///
/// # async fn example(scheduler: TaskScheduler) -> novel_tasks::Result<()> {
/// scheduler.start();
///
/// // Run with automatic signal handling
/// run_with_shutdown(scheduler).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_with_shutdown(scheduler: TaskScheduler) -> Result<()> {
    wait_for_signal().await;
    scheduler.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
