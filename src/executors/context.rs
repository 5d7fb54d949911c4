//! Per-execution handle passed to executors.

use crate::error::{Error, Result};
use crate::notification::ThrottledNotifier;
use crate::task_store::TaskStore;
use crate::types::{Event, Task, TaskId, TaskMetadata};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Progress channel of one running task
///
/// Each report transforms the task's queued metadata, refreshes the
/// notification and emits [`Event::TaskProgress`].
#[derive(Clone)]
pub struct ProgressReporter {
    id: TaskId,
    title: String,
    store: TaskStore,
    notifier: ThrottledNotifier,
    event_tx: broadcast::Sender<Event>,
}

impl ProgressReporter {
    pub(crate) fn new(
        id: TaskId,
        title: String,
        store: TaskStore,
        notifier: ThrottledNotifier,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            id,
            title,
            store,
            notifier,
            event_tx,
        }
    }

    /// Apply a metadata transform
    ///
    /// Does nothing once the task has left the queue.
    pub fn report(&self, f: impl FnOnce(TaskMetadata) -> TaskMetadata) {
        let mut updated = None;
        self.store.update_meta(&self.id, |meta| {
            let next = f(meta);
            updated = Some(next.clone());
            next
        });
        let Some(meta) = updated else {
            return;
        };

        self.notifier.update(
            self.title.as_str(),
            meta.progress_text.clone().unwrap_or_default(),
            meta.progress,
            false,
        );
        self.event_tx
            .send(Event::TaskProgress {
                id: self.id.clone(),
                progress: meta.progress,
                text: meta.progress_text,
            })
            .ok();
    }
}

/// Handle for executors that enqueue follow-up work
///
/// Tasks sent here are added by the scheduler on its next iteration, subject
/// to the usual duplicate rules.
#[derive(Clone)]
pub struct TaskSender {
    tx: mpsc::UnboundedSender<Vec<Task>>,
}

impl TaskSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Vec<Task>>) -> Self {
        Self { tx }
    }

    /// Queue tasks; returns false when the scheduler is gone
    pub fn send(&self, tasks: Vec<Task>) -> bool {
        if tasks.is_empty() {
            return true;
        }
        self.tx.send(tasks).is_ok()
    }
}

/// Everything an executor may touch while running one task
#[derive(Clone)]
pub struct ExecutionContext {
    /// Id of the running task
    pub task_id: TaskId,
    cancel: CancellationToken,
    progress: ProgressReporter,
    sender: TaskSender,
}

impl ExecutionContext {
    pub(crate) fn new(
        task_id: TaskId,
        cancel: CancellationToken,
        progress: ProgressReporter,
        sender: TaskSender,
    ) -> Self {
        Self {
            task_id,
            cancel,
            progress,
            sender,
        }
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Error::Cancelled)` once cancellation was requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Token that fires on cancellation, for use in `tokio::select!`
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Report progress (see [`ProgressReporter::report`])
    pub fn report(&self, f: impl FnOnce(TaskMetadata) -> TaskMetadata) {
        self.progress.report(f);
    }

    /// Queue follow-up tasks
    pub fn enqueue(&self, tasks: Vec<Task>) -> bool {
        self.sender.send(tasks)
    }
}
