//! Write-behind cache over the persisted task queue
//!
//! Every queue mutation lands in an in-memory "pending" snapshot and arms a
//! single debounce timer; the timer (or an explicit [`TaskStore::flush`])
//! writes the snapshot under [`QUEUE_KEY`] and then notifies listeners.
//!
//! Code that must observe its own writes on the next loop iteration calls
//! `flush()` instead of waiting for the timer. Nothing auto-flushes on
//! mutation, so a burst of updates costs one write and one notification.

use crate::db::{KeyValueStore, QUEUE_KEY};
use crate::error::Result;
use crate::types::{QueuedTask, TaskId, TaskKind, TaskMetadata};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

type QueueListener = Arc<dyn Fn(&[QueuedTask]) + Send + Sync>;
type KindListener = Arc<dyn Fn(Option<&QueuedTask>) + Send + Sync>;

#[derive(Default)]
struct CacheState {
    /// Last snapshot written to the store
    committed: Vec<QueuedTask>,
    /// Mutations not yet written
    pending: Option<Vec<QueuedTask>>,
    /// Kinds touched since the last flush
    pending_kinds: BTreeSet<TaskKind>,
    /// Bumped on every mutation
    version: u64,
    timer_armed: bool,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    all: Vec<(u64, QueueListener)>,
    by_kind: Vec<(u64, TaskKind, KindListener)>,
}

struct Inner {
    kv: Arc<dyn KeyValueStore>,
    debounce: Duration,
    state: Mutex<CacheState>,
    /// Serializes writes so snapshots reach the store in order
    write_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<Listeners>,
}

/// Durable, debounced task queue (cloneable - all state is Arc-wrapped)
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Inner>,
}

impl TaskStore {
    /// Load the persisted queue
    ///
    /// Entries that no longer deserialize (missing id, unknown kind, bad payload)
    /// and entries repeating an earlier id are dropped with a warning.
    pub async fn load(kv: Arc<dyn KeyValueStore>, debounce: Duration) -> Result<Self> {
        let committed = match kv.get(QUEUE_KEY).await? {
            None => Vec::new(),
            Some(serde_json::Value::Array(items)) => parse_queue(items),
            Some(other) => {
                tracing::warn!(
                    value_type = json_type(&other),
                    "Persisted queue is not an array, starting empty"
                );
                Vec::new()
            }
        };

        if !committed.is_empty() {
            tracing::info!(tasks = committed.len(), "Restored persisted task queue");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                kv,
                debounce,
                state: Mutex::new(CacheState {
                    committed,
                    ..Default::default()
                }),
                write_lock: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(Listeners::default()),
            }),
        })
    }

    /// The last flushed snapshot
    pub fn get_all(&self) -> Vec<QueuedTask> {
        self.inner.state.lock().committed.clone()
    }

    /// The newest view of the queue, including unflushed mutations
    pub(crate) fn latest(&self) -> Vec<QueuedTask> {
        let state = self.inner.state.lock();
        state
            .pending
            .as_ref()
            .unwrap_or(&state.committed)
            .clone()
    }

    /// Whether mutations are waiting to be written
    pub fn has_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Replace the whole queue
    pub fn replace(&self, queue: Vec<QueuedTask>, kind: Option<TaskKind>) {
        self.update(kind, move |current| *current = queue);
    }

    /// Apply `f` atomically to the newest view of the queue and schedule a write
    ///
    /// `kind` tags the eventual flush for per-kind listeners. `f` runs under the
    /// cache lock and must not call back into the store.
    pub fn update<R>(&self, kind: Option<TaskKind>, f: impl FnOnce(&mut Vec<QueuedTask>) -> R) -> R {
        self.mutate(|queue, kinds| {
            kinds.extend(kind);
            f(queue)
        })
    }

    /// Transform one task's metadata; returns false when the id is not queued
    pub fn update_meta(&self, id: &TaskId, f: impl FnOnce(TaskMetadata) -> TaskMetadata) -> bool {
        self.mutate(|queue, kinds| match queue.iter_mut().find(|t| &t.id == id) {
            Some(task) => {
                task.meta = f(std::mem::take(&mut task.meta));
                kinds.insert(task.kind());
                true
            }
            None => false,
        })
    }

    /// Apply `f` to the newest view; `f` records the kinds the flush should be tagged with
    pub(crate) fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Vec<QueuedTask>, &mut BTreeSet<TaskKind>) -> R,
    ) -> R {
        let result = {
            let mut state = self.inner.state.lock();
            let mut queue = match state.pending.take() {
                Some(queue) => queue,
                None => state.committed.clone(),
            };
            let mut kinds = std::mem::take(&mut state.pending_kinds);
            let result = f(&mut queue, &mut kinds);
            state.pending = Some(queue);
            state.pending_kinds = kinds;
            state.version += 1;
            result
        };
        self.arm_timer();
        result
    }

    fn arm_timer(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.timer_armed {
                return;
            }
            state.timer_armed = true;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Outside a runtime the mutation waits for an explicit flush
            self.inner.state.lock().timer_armed = false;
            return;
        };

        let store = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(store.inner.debounce).await;
            store.inner.state.lock().timer_armed = false;
            if let Err(e) = store.flush().await {
                tracing::error!(error = %e, "Debounced queue write failed");
            }
        });
    }

    /// Write pending mutations now and notify listeners
    ///
    /// Returns immediately when nothing is pending. When the write fails the
    /// in-memory queue still advances and listeners are still notified; the
    /// next flush writes the full queue again.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;

        let (snapshot, version, kinds) = {
            let mut state = self.inner.state.lock();
            let Some(pending) = state.pending.as_ref() else {
                return Ok(());
            };
            let snapshot = pending.clone();
            let kinds = std::mem::take(&mut state.pending_kinds);
            (snapshot, state.version, kinds)
        };

        let write_result = match serde_json::to_value(&snapshot) {
            Ok(value) => self.inner.kv.set(QUEUE_KEY, &value).await,
            Err(e) => Err(e.into()),
        };

        {
            let mut state = self.inner.state.lock();
            state.committed = snapshot.clone();
            if state.version == version {
                state.pending = None;
            }
        }

        self.notify(&snapshot, &kinds);

        if let Err(ref e) = write_result {
            tracing::error!(error = %e, tasks = snapshot.len(), "Failed to persist task queue");
        }
        write_result
    }

    fn notify(&self, queue: &[QueuedTask], kinds: &BTreeSet<TaskKind>) {
        let (all, by_kind) = {
            let listeners = self.inner.listeners.lock();
            let all: Vec<QueueListener> = listeners.all.iter().map(|(_, l)| l.clone()).collect();
            let by_kind: Vec<(TaskKind, KindListener)> = listeners
                .by_kind
                .iter()
                .filter(|(_, kind, _)| *kind != TaskKind::DownloadChapter && kinds.contains(kind))
                .map(|(_, kind, l)| (*kind, l.clone()))
                .collect();
            (all, by_kind)
        };

        for listener in all {
            listener(queue);
        }
        for (kind, listener) in by_kind {
            listener(queue.iter().find(|t| t.kind() == kind));
        }
    }

    /// Call `listener` with the first task of `kind` after each flush touching that kind
    ///
    /// Chapter download flushes only reach [`observe_all`](Self::observe_all) listeners.
    pub fn observe(
        &self,
        kind: TaskKind,
        listener: impl Fn(Option<&QueuedTask>) + Send + Sync + 'static,
    ) -> Subscription {
        let mut listeners = self.inner.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.by_kind.push((id, kind, Arc::new(listener)));
        Subscription::new(&self.inner, id)
    }

    /// Call `listener` with the full queue after every flush
    pub fn observe_all(
        &self,
        listener: impl Fn(&[QueuedTask]) + Send + Sync + 'static,
    ) -> Subscription {
        let mut listeners = self.inner.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.all.push((id, Arc::new(listener)));
        Subscription::new(&self.inner, id)
    }
}

/// Listener registration; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Weak<Inner>,
    id: u64,
}

impl Subscription {
    fn new(inner: &Arc<Inner>, id: u64) -> Self {
        Self {
            store: Arc::downgrade(inner),
            id,
        }
    }

    /// Unsubscribe explicitly
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            let mut listeners = inner.listeners.lock();
            listeners.all.retain(|(id, _)| *id != self.id);
            listeners.by_kind.retain(|(id, _, _)| *id != self.id);
        }
    }
}

fn parse_queue(items: Vec<serde_json::Value>) -> Vec<QueuedTask> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<QueuedTask>(item) {
            Ok(mut task) if seen.insert(task.id.clone()) => {
                if task.meta.name.is_empty() {
                    task.meta.name = task.task.display_name();
                }
                Some(task)
            }
            Ok(task) => {
                tracing::warn!(task_id = %task.id, "Dropping duplicate persisted task");
                None
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "Dropping malformed persisted task");
                None
            }
        })
        .collect()
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
