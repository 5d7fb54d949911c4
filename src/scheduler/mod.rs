//! The background task scheduler, split into focused submodules.
//!
//! The `TaskScheduler` struct and its methods are organized by domain:
//! - [`enqueue`] - Adding tasks (duplicate rules, batching)
//! - [`control`] - Pause/resume/stop, cancellation, reordering, pause lists
//! - [`run_loop`] - The cooperative loop and its per-iteration algorithm
//! - [`chapters`] - Spawning and finishing chapter downloads
//! - [`lifecycle`] - Construction, crash resume, graceful shutdown
//! - [`network`] - Wi-Fi gating and the connectivity listener

mod chapters;
mod control;
mod enqueue;
mod lifecycle;
mod network;
mod run_loop;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::coordinator::DownloadCoordinator;
use crate::db::KeyValueStore;
use crate::executors::{ExecutionContext, Executors, ProgressReporter, TaskSender};
use crate::library::Library;
use crate::notification::{NotificationSink, ThrottledNotifier};
use crate::task_store::TaskStore;
use crate::types::{ConnectionType, Event, NovelId, QueuedTask, RunSummary, Task, TaskId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// External services a scheduler is built on
pub struct Collaborators {
    /// Keyed JSON persistence (queue snapshot, pause lists)
    pub kv: Arc<dyn KeyValueStore>,
    /// Library store, read by novel download expansion
    pub library: Arc<dyn Library>,
    /// Execution strategies
    pub executors: Arc<dyn Executors>,
    /// Notification surface
    pub sink: Arc<dyn NotificationSink>,
    /// Connectivity updates; `None` treats the link as unmetered
    pub network: Option<watch::Receiver<ConnectionType>>,
}

/// Cancellation bookkeeping
///
/// Ids stay in `cancelled` for the life of the process; `tokens` only holds
/// tasks currently executing.
#[derive(Default)]
pub(crate) struct Cancellations {
    pub(crate) cancelled: HashSet<TaskId>,
    pub(crate) tokens: HashMap<TaskId, CancellationToken>,
}

/// Loop flags and wake-up plumbing
#[derive(Clone)]
pub(crate) struct ControlState {
    /// Dispatching suspended by `pause()`
    pub(crate) paused: Arc<AtomicBool>,
    /// A run loop task exists
    pub(crate) loop_active: Arc<AtomicBool>,
    /// Keep-alive while the user is reading
    pub(crate) reading_session: Arc<AtomicBool>,
    /// Cleared by `shutdown()`
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Last run ended waiting for an unmetered connection
    pub(crate) waiting_for_network: Arc<AtomicBool>,
    /// `start()` was called while a run was winding down
    pub(crate) restart_requested: Arc<AtomicBool>,
    /// Bumped by every pause so a stale auto-resume timer does nothing
    pub(crate) pause_generation: Arc<AtomicU64>,
    /// Chapter downloads spawned and not yet finished
    pub(crate) in_flight: Arc<AtomicUsize>,
    /// Wakes the loop early (new task, resume, finished download)
    pub(crate) wake: Arc<Notify>,
    /// Stops background listeners on shutdown
    pub(crate) shutdown_token: CancellationToken,
    pub(crate) cancellations: Arc<Mutex<Cancellations>>,
    pub(crate) paused_plugins: Arc<Mutex<HashSet<String>>>,
    pub(crate) paused_novels: Arc<Mutex<HashSet<NovelId>>>,
}

/// Tasks seen during the current run that share a display group
#[derive(Default)]
pub(crate) struct ProgressGroup {
    seen: HashSet<TaskId>,
    done: usize,
}

/// Bookkeeping of the current run
#[derive(Default)]
pub(crate) struct RunState {
    pub(crate) summary: RunSummary,
    pub(crate) groups: HashMap<String, ProgressGroup>,
}

impl RunState {
    /// Merge newly observed tasks into their groups
    pub(crate) fn observe(&mut self, queue: &[QueuedTask]) {
        for task in queue {
            self.groups
                .entry(group_name(&task.task))
                .or_default()
                .seen
                .insert(task.id.clone());
        }
    }

    /// Title of a task, with its position in its group when the group has several
    pub(crate) fn title(&self, task: &QueuedTask) -> String {
        let name = group_name(&task.task);
        match self.groups.get(&name) {
            Some(group) if group.seen.len() > 1 => {
                format!(
                    "{} ({}/{})",
                    task.meta.name,
                    (group.done + 1).min(group.seen.len()),
                    group.seen.len()
                )
            }
            _ => task.meta.name.clone(),
        }
    }

    pub(crate) fn finish(&mut self, task: &Task) {
        if let Some(group) = self.groups.get_mut(&group_name(task)) {
            group.done += 1;
        }
    }
}

/// Chapter downloads of one novel form a group; other tasks group by name
fn group_name(task: &Task) -> String {
    match task {
        Task::DownloadChapter(data) => format!("Download {}", data.novel_name),
        other => other.display_name(),
    }
}

/// Background task scheduler (cloneable - all fields are Arc-wrapped)
///
/// Owns the queue, the download coordinator and the notifier. Construct one
/// with [`TaskScheduler::new`] at process start and share clones of it.
#[derive(Clone)]
pub struct TaskScheduler {
    pub(crate) config: Arc<Config>,
    pub(crate) store: TaskStore,
    pub(crate) coordinator: Arc<DownloadCoordinator>,
    pub(crate) notifier: ThrottledNotifier,
    pub(crate) executors: Arc<dyn Executors>,
    pub(crate) kv: Arc<dyn KeyValueStore>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) control: ControlState,
    pub(crate) run: Arc<Mutex<RunState>>,
    /// Follow-up tasks sent by executors
    pub(crate) spawn_tx: mpsc::UnboundedSender<Vec<Task>>,
    pub(crate) spawn_rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<Task>>>>,
    pub(crate) network: Option<watch::Receiver<ConnectionType>>,
}

impl TaskScheduler {
    /// Subscribe to scheduler events
    ///
    /// Each subscriber receives every event independently. A subscriber that
    /// falls more than 1000 events behind receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers; dropped when nobody listens
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// The configuration in force
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The queue, including mutations not yet written
    pub fn queue(&self) -> Vec<QueuedTask> {
        self.store.latest()
    }

    /// Whether `id` was ever cancelled
    pub fn is_cancelled(&self, id: &TaskId) -> bool {
        self.control.cancellations.lock().cancelled.contains(id)
    }

    /// Register a running task and hand out its cancellation token
    ///
    /// Returns `None` when the id was cancelled before it could start.
    pub(crate) fn register_execution(&self, id: &TaskId) -> Option<CancellationToken> {
        let mut cancellations = self.control.cancellations.lock();
        if cancellations.cancelled.contains(id) {
            return None;
        }
        let token = CancellationToken::new();
        cancellations.tokens.insert(id.clone(), token.clone());
        Some(token)
    }

    pub(crate) fn release_execution(&self, id: &TaskId) {
        self.control.cancellations.lock().tokens.remove(id);
    }

    /// Mark ids cancelled and signal any that are executing
    pub(crate) fn mark_cancelled<'a>(&self, ids: impl IntoIterator<Item = &'a TaskId>) {
        let mut cancellations = self.control.cancellations.lock();
        for id in ids {
            cancellations.cancelled.insert(id.clone());
            if let Some(token) = cancellations.tokens.get(id) {
                token.cancel();
            }
        }
    }

    pub(crate) fn execution_context(
        &self,
        id: &TaskId,
        title: String,
        cancel: CancellationToken,
    ) -> ExecutionContext {
        let progress = ProgressReporter::new(
            id.clone(),
            title,
            self.store.clone(),
            self.notifier.clone(),
            self.event_tx.clone(),
        );
        ExecutionContext::new(
            id.clone(),
            cancel,
            progress,
            TaskSender::new(self.spawn_tx.clone()),
        )
    }

    pub(crate) fn wake(&self) {
        self.control.wake.notify_one();
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.control.in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count and wakes the loop when a download ends
pub(crate) struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    wake: Arc<Notify>,
}

impl InFlightGuard {
    pub(crate) fn new(control: &ControlState) -> Self {
        control.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            in_flight: control.in_flight.clone(),
            wake: control.wake.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.wake.notify_one();
    }
}
