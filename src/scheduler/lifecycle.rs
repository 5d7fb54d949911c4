//! Startup and shutdown coordination.

use crate::config::Config;
use crate::coordinator::DownloadCoordinator;
use crate::db::{KeyValueStore, PAUSED_NOVELS_KEY, PAUSED_PLUGINS_KEY};
use crate::error::{Error, Result};
use crate::notification::ThrottledNotifier;
use crate::task_store::TaskStore;
use crate::types::Event;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::{Collaborators, ControlState, RunState, TaskScheduler};

impl TaskScheduler {
    /// Create a scheduler and restore the persisted queue
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Records the start in the store (for unclean shutdown detection)
    /// - Loads the queue, dropping malformed records
    /// - Marks interrupted tasks as not running, so they restart
    /// - Loads the paused plugin and novel lists
    /// - Starts the connectivity listener when a network source is given
    ///
    /// The scheduler does not start on its own; call [`start`](Self::start)
    /// or add a task.
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            kv,
            library,
            executors,
            sink,
            network,
        } = collaborators;

        if kv.mark_started().await? {
            tracing::warn!("Previous run did not shut down cleanly, resuming persisted queue");
        }

        let store = TaskStore::load(kv.clone(), config.persistence.write_debounce).await?;
        let interrupted = store.get_all().iter().filter(|t| t.meta.is_running).count();
        if interrupted > 0 {
            store.update(None, |queue| {
                for task in queue.iter_mut() {
                    task.meta.is_running = false;
                }
            });
            store.flush().await?;
            tracing::info!(interrupted, "Reset interrupted tasks for restart");
        }

        let paused_plugins: HashSet<String> = load_id_set(kv.as_ref(), PAUSED_PLUGINS_KEY).await?;
        let paused_novels: HashSet<i64> = load_id_set(kv.as_ref(), PAUSED_NOVELS_KEY).await?;

        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);
        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();

        let control = ControlState {
            paused: Arc::new(AtomicBool::new(false)),
            loop_active: Arc::new(AtomicBool::new(false)),
            reading_session: Arc::new(AtomicBool::new(false)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            waiting_for_network: Arc::new(AtomicBool::new(false)),
            restart_requested: Arc::new(AtomicBool::new(false)),
            pause_generation: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            wake: Arc::new(Notify::new()),
            shutdown_token: CancellationToken::new(),
            cancellations: Arc::new(Mutex::new(Default::default())),
            paused_plugins: Arc::new(Mutex::new(paused_plugins)),
            paused_novels: Arc::new(Mutex::new(paused_novels)),
        };

        let scheduler = Self {
            coordinator: Arc::new(DownloadCoordinator::new(config.download.clone(), library)),
            notifier: ThrottledNotifier::new(config.notifications.clone(), sink),
            config: Arc::new(config),
            store,
            executors,
            kv,
            event_tx,
            control,
            run: Arc::new(Mutex::new(RunState::default())),
            spawn_tx,
            spawn_rx: Arc::new(Mutex::new(spawn_rx)),
            network,
        };

        scheduler.spawn_network_listener();

        tracing::info!(
            queued = scheduler.store.get_all().len(),
            "Task scheduler initialized"
        );
        Ok(scheduler)
    }

    /// Gracefully shut down the scheduler
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new tasks and dispatching queued ones
    /// 2. Waits for in-flight chapter downloads with a timeout (30 seconds)
    /// 3. Flushes the queue to the store
    /// 4. Marks a clean shutdown
    ///
    /// Unlike [`stop`](Self::stop), the queue is preserved for the next process.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.control.accepting_new.store(false, Ordering::SeqCst);
        self.control.shutdown_token.cancel();
        self.wake();
        tracing::info!("Stopped accepting new tasks");

        let shutdown_timeout = Duration::from_secs(30);
        match tokio::time::timeout(shutdown_timeout, self.wait_for_in_flight()).await {
            Ok(()) => tracing::info!("All in-flight downloads completed"),
            Err(_) => tracing::warn!(
                in_flight = self.in_flight(),
                "Timeout waiting for downloads to complete, proceeding with shutdown"
            ),
        }

        if let Err(e) = self.store.flush().await {
            tracing::error!(error = %e, "Failed to persist queue during shutdown");
        } else {
            tracing::info!(tasks = self.store.get_all().len(), "Queue persisted");
        }

        if let Err(e) = self.kv.mark_stopped().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown");
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Whether new tasks are still accepted
    pub fn is_accepting(&self) -> bool {
        self.control.accepting_new.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Wait until every spawned chapter download has finished
    pub(crate) async fn wait_for_in_flight(&self) {
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                return;
            }
            tracing::debug!(in_flight, "Waiting for in-flight downloads");
            tokio::select! {
                _ = self.control.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }
}

/// Read a persisted id list, treating a missing or unreadable list as empty
async fn load_id_set<T>(kv: &dyn KeyValueStore, key: &str) -> Result<HashSet<T>>
where
    T: DeserializeOwned + Eq + Hash,
{
    let Some(value) = kv.get(key).await? else {
        return Ok(HashSet::new());
    };
    match serde_json::from_value::<Vec<T>>(value) {
        Ok(ids) => Ok(ids.into_iter().collect()),
        Err(e) => {
            tracing::warn!(key, error = %e, "Ignoring unreadable pause list");
            Ok(HashSet::new())
        }
    }
}
