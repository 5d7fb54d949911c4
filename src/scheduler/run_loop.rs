//! The cooperative run loop.
//!
//! One loop task exists per run. Each iteration flushes the store, expands
//! novel downloads, then either executes one foreground task or starts at
//! most one chapter download. Chapter downloads run on their own tasks and
//! never block the loop.

use crate::error::Result;
use crate::executors::dispatch;
use crate::notification::NotificationAction;
use crate::types::{
    DownloadNovelData, Event, QueuedTask, Task, TaskId, TaskKind, TaskMetadata, TaskOutput,
};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::{RunState, TaskScheduler};

/// What one loop iteration did
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Iteration {
    /// Dispatching is paused
    Paused,
    /// A foreground task ran to completion
    ExecutedTask(TaskId),
    /// A chapter download was spawned
    StartedDownload(TaskId),
    /// Nothing could be dispatched yet
    Waiting,
    /// Downloads are held until an unmetered connection returns
    WaitingForNetwork,
    /// Queue empty, nothing in flight, no reading session
    Finished,
}

impl TaskScheduler {
    /// Drive iterations until the run is over
    pub(crate) async fn run(self) {
        tracing::info!(queued = self.store.latest().len(), "Run started");
        self.control.restart_requested.store(false, Ordering::SeqCst);
        self.coordinator.reset_counters();
        *self.run.lock() = RunState::default();
        self.notifier.reset();
        self.notifier.set_action(Some(NotificationAction::Pause));
        self.emit_event(Event::RunStarted);

        loop {
            if !self.is_accepting() {
                tracing::debug!("Run interrupted by shutdown");
                break;
            }
            match self.run_iteration().await {
                Iteration::Finished => break,
                Iteration::WaitingForNetwork => {
                    self.control.waiting_for_network.store(true, Ordering::SeqCst);
                    tracing::info!("Waiting for an unmetered connection");
                    self.emit_event(Event::WaitingForNetwork);
                    break;
                }
                Iteration::ExecutedTask(_) | Iteration::StartedDownload(_) => {
                    tokio::task::yield_now().await;
                }
                Iteration::Paused | Iteration::Waiting => self.idle().await,
            }
        }

        self.wait_for_in_flight().await;
        if let Err(e) = self.store.flush().await {
            tracing::error!(error = %e, "Failed to persist queue at end of run");
        }

        let summary = std::mem::take(&mut self.run.lock().summary);
        let reading = self.control.reading_session.load(Ordering::SeqCst);
        if self.is_accepting() && !reading && !summary.is_empty() {
            self.notifier
                .notify_once("Background tasks finished", summary.describe());
        }
        tracing::info!(summary = %summary.describe(), "Run finished");
        self.emit_event(Event::RunFinished { summary });

        self.release_loop();
    }

    /// Mark the loop inactive and start another run if work is still due
    ///
    /// A run ending on the network gate only restarts when something asked
    /// for it during teardown, or when the connection came back before the
    /// gate flag was visible to the connectivity listener.
    pub(crate) fn release_loop(&self) {
        self.control.loop_active.store(false, Ordering::SeqCst);
        let requested = self.control.restart_requested.swap(false, Ordering::SeqCst);
        let network_back = self.allows_downloads()
            && self.control.waiting_for_network.swap(false, Ordering::SeqCst);
        let gated = self.control.waiting_for_network.load(Ordering::SeqCst);

        if (requested || network_back || !gated)
            && !self.is_paused()
            && !self.store.latest().is_empty()
        {
            self.start();
        }
    }

    /// Write pending queue changes
    ///
    /// A failed write is logged by the store and stays pending for the next
    /// flush, so the run carries on with the in-memory queue.
    async fn persist(&self) {
        self.store.flush().await.ok();
    }

    /// Sleep one poll interval (plus jitter) or until woken
    async fn idle(&self) {
        let config = &self.config.scheduler;
        let jitter_ms = config.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        tokio::select! {
            _ = self.control.wake.notified() => {}
            _ = tokio::time::sleep(config.poll_interval + jitter) => {}
        }
    }

    /// Run one iteration of the loop
    pub(crate) async fn run_iteration(&self) -> Iteration {
        if let Err(e) = self.drain_follow_ups().await {
            tracing::warn!(error = %e, "Dropped follow-up tasks");
        }
        self.persist().await;

        let queue = self.store.get_all();
        self.coordinator.reconcile_state(&queue);
        self.run.lock().observe(&queue);

        if queue.is_empty() {
            let reading = self.control.reading_session.load(Ordering::SeqCst);
            return if reading || self.in_flight() > 0 {
                Iteration::Waiting
            } else {
                Iteration::Finished
            };
        }

        if self.is_paused() {
            return Iteration::Paused;
        }

        self.expand_novel_downloads().await;

        let queue = self.store.get_all();
        if let Some(task) = queue.iter().find(|t| !t.kind().is_download()).cloned() {
            let id = task.id.clone();
            self.execute_foreground(task).await;
            return Iteration::ExecutedTask(id);
        }

        self.dispatch_download(&queue)
    }

    /// Expand every novel download present in this iteration
    async fn expand_novel_downloads(&self) {
        let novel_ids: Vec<TaskId> = self
            .store
            .latest()
            .iter()
            .filter(|t| t.kind() == TaskKind::DownloadNovel)
            .map(|t| t.id.clone())
            .collect();

        for id in novel_ids {
            let queue = self.store.latest();
            let Some(task) = queue.iter().find(|t| t.id == id) else {
                continue;
            };
            let Some(data) = task.task.as_novel() else {
                continue;
            };

            match self.coordinator.expand_novel_task(data, &queue).await {
                Err(e) => {
                    tracing::error!(
                        task_id = %id,
                        novel_id = data.novel_id,
                        error = %e,
                        "Novel expansion failed"
                    );
                    let title = self.run.lock().title(task);
                    self.complete_task(task, &title, Err(e)).await;
                }
                Ok(expansion) if expansion.is_complete => {
                    let updated = expansion.updated;
                    tracing::info!(
                        task_id = %id,
                        novel_id = updated.novel_id,
                        completed = updated.completed_count,
                        total = updated.total_count,
                        "Novel download complete"
                    );
                    let result = serde_json::json!({
                        "completed": updated.completed_count,
                        "total": updated.total_count,
                        "failed": updated.failed_chapter_ids,
                    });
                    self.store.update(Some(TaskKind::DownloadNovel), |queue| {
                        if let Some(entry) = queue.iter_mut().find(|t| t.id == id) {
                            entry.task = Task::DownloadNovel(updated);
                        }
                    });
                    let title = self.run.lock().title(task);
                    self.complete_task(task, &title, Ok(TaskOutput::Done(Some(result))))
                        .await;
                }
                Ok(expansion) => {
                    let updated = expansion.updated;
                    let before = data.clone();
                    let added = self.store.mutate(|queue, kinds| {
                        let Some(entry) = queue.iter_mut().find(|t| t.id == id) else {
                            return Vec::new();
                        };
                        let Task::DownloadNovel(current) = &mut entry.task else {
                            return Vec::new();
                        };
                        merge_expansion(current, &before, &updated);
                        let progress = if current.total_count == 0 {
                            1.0
                        } else {
                            current.completed_count as f64 / current.total_count as f64
                        };
                        let text = format!(
                            "{}/{} chapters",
                            current.completed_count, current.total_count
                        );
                        entry.meta = TaskMetadata {
                            is_running: true,
                            ..std::mem::take(&mut entry.meta)
                        }
                        .with_progress(progress)
                        .with_text(text);
                        kinds.insert(TaskKind::DownloadNovel);

                        let mut added = Vec::new();
                        for chapter in expansion.new_chapter_tasks {
                            let queued = QueuedTask::new(chapter);
                            added.push(queued.id.clone());
                            queue.push(queued);
                        }
                        if !added.is_empty() {
                            kinds.insert(TaskKind::DownloadChapter);
                        }
                        added
                    });
                    if !added.is_empty() {
                        tracing::debug!(
                            task_id = %id,
                            added = added.len(),
                            "Queued chapter downloads"
                        );
                    }
                    for chapter_id in added {
                        self.emit_event(Event::TaskQueued {
                            id: chapter_id,
                            kind: TaskKind::DownloadChapter,
                        });
                    }
                }
            }
            self.persist().await;
        }
    }

    /// Execute one foreground task and remove it
    async fn execute_foreground(&self, task: QueuedTask) {
        let Some(token) = self.register_execution(&task.id) else {
            tracing::debug!(task_id = %task.id, "Skipping cancelled task");
            self.store
                .update(Some(task.kind()), |queue| queue.retain(|t| t.id != task.id));
            self.persist().await;
            return;
        };

        let title = self.run.lock().title(&task);
        self.store.update_meta(&task.id, |meta| TaskMetadata {
            is_running: true,
            ..meta
        });
        self.persist().await;

        tracing::info!(task_id = %task.id, kind = %task.kind(), "Executing task");
        self.emit_event(Event::TaskStarted {
            id: task.id.clone(),
            kind: task.kind(),
        });
        self.notifier.update(title.clone(), "", None, true);

        let ctx = self.execution_context(&task.id, title.clone(), token);
        let result = dispatch(self.executors.as_ref(), &task.task, &ctx).await;
        self.complete_task(&task, &title, result).await;
    }

    /// Record how a task ended and remove it from the queue
    ///
    /// Success stores the final metadata (progress 1 and the result) and
    /// flushes it before the entry is removed, so observers can read it.
    pub(crate) async fn complete_task(
        &self,
        task: &QueuedTask,
        title: &str,
        result: Result<TaskOutput>,
    ) {
        let id = &task.id;
        let kind = task.kind();
        let cancelled =
            self.is_cancelled(id) || result.as_ref().is_err_and(|e| e.is_cancelled());

        match result {
            _ if cancelled => {
                tracing::info!(task_id = %id, kind = %kind, "Task cancelled");
            }
            Ok(TaskOutput::Done(result)) => {
                let retained = result.clone();
                self.store.update_meta(id, |meta| TaskMetadata {
                    result: retained,
                    ..meta.with_progress(1.0)
                });
                self.persist().await;
                self.run.lock().summary.record_completed(kind);
                tracing::info!(task_id = %id, kind = %kind, "Task completed");
                self.notifier.update(title, "Done", Some(1.0), false);
                self.emit_event(Event::TaskCompleted {
                    id: id.clone(),
                    kind,
                    result,
                });
            }
            Ok(TaskOutput::Skipped) => {
                self.run.lock().summary.skipped += 1;
                tracing::debug!(task_id = %id, kind = %kind, "Task skipped");
                self.emit_event(Event::TaskSkipped {
                    id: id.clone(),
                    kind,
                });
            }
            Err(e) => {
                self.run.lock().summary.failed += 1;
                tracing::error!(task_id = %id, kind = %kind, error = %e, "Task failed");
                self.notifier
                    .notify_once(format!("{} failed", task.meta.name), e.to_string());
                self.emit_event(Event::TaskFailed {
                    id: id.clone(),
                    kind,
                    error: e.to_string(),
                });
            }
        }

        self.store
            .update(Some(kind), |queue| queue.retain(|t| &t.id != id));
        self.persist().await;
        self.release_execution(id);
        self.run.lock().finish(&task.task);
    }

    /// Start the first chapter download allowed to start
    fn dispatch_download(&self, queue: &[QueuedTask]) -> Iteration {
        if !self.allows_downloads() {
            return if self.in_flight() == 0 {
                Iteration::WaitingForNetwork
            } else {
                Iteration::Waiting
            };
        }

        let limit = self.coordinator.config().global_limit();
        if self.coordinator.active_count() >= limit {
            return Iteration::Waiting;
        }

        let paused_plugins: HashSet<String> = self.control.paused_plugins.lock().clone();
        let paused_novels = self.control.paused_novels.lock().clone();

        for task in queue {
            let Some(chapter) = task.task.as_chapter() else {
                continue;
            };
            if self.is_cancelled(&task.id) {
                continue;
            }
            let decision =
                self.coordinator
                    .can_start(&task.id, chapter, &paused_plugins, &paused_novels);
            match decision.reason() {
                None => {
                    if self.start_chapter(task.clone(), chapter.clone()) {
                        return Iteration::StartedDownload(task.id.clone());
                    }
                }
                Some(reason) => {
                    tracing::trace!(task_id = %task.id, %reason, "Chapter download blocked");
                }
            }
        }
        Iteration::Waiting
    }
}

/// Apply what an expansion changed onto the newest copy of a novel download
///
/// The expansion ran against `before`; chapter downloads that finished in the
/// meantime already patched `current`, so only the expansion's own changes
/// are replayed.
fn merge_expansion(
    current: &mut DownloadNovelData,
    before: &DownloadNovelData,
    updated: &DownloadNovelData,
) {
    let Some(previous) = before.pending_chapter_ids.as_ref() else {
        if current.pending_chapter_ids.is_none() {
            *current = updated.clone();
        }
        return;
    };
    let remaining: HashSet<_> = updated.pending_chapter_ids.iter().flatten().collect();
    for chapter_id in previous.iter().filter(|id| !remaining.contains(id)) {
        let failed = updated.failed_chapter_ids.contains(chapter_id)
            && !before.failed_chapter_ids.contains(chapter_id);
        current.record_chapter_outcome(*chapter_id, !failed);
    }
}
