//! Queue control: pause/resume/stop, cancellation, reordering and pause lists.

use crate::db::{PAUSED_NOVELS_KEY, PAUSED_PLUGINS_KEY};
use crate::error::{Error, Result};
use crate::notification::NotificationAction;
use crate::task_store::Subscription;
use crate::types::{
    DownloadChapterData, Event, NovelId, QueuedTask, SchedulerState, Task, TaskId, TaskKind,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

use super::TaskScheduler;

impl TaskScheduler {
    /// Start the run loop if it is not running
    ///
    /// Called automatically by [`add_task`](Self::add_task) and
    /// [`resume`](Self::resume). When the loop is already running this only
    /// wakes it so it re-reads the queue.
    pub fn start(&self) {
        if !self.is_accepting() {
            return;
        }
        if self.control.loop_active.swap(true, Ordering::SeqCst) {
            // The running loop may already be past its last queue check
            self.control.restart_requested.store(true, Ordering::SeqCst);
            self.wake();
            return;
        }
        self.control.waiting_for_network.store(false, Ordering::SeqCst);
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await });
    }

    /// Pause dispatching
    ///
    /// Queued tasks stay queued and chapter downloads already in flight run to
    /// completion; the loop stops dispatching new work within one iteration.
    /// The ongoing notification switches to a "resume" action. When
    /// `scheduler.auto_resume_after` is configured, a timer resumes the
    /// scheduler after that delay unless it was resumed (or paused again)
    /// in the meantime.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use novel_tasks::TaskScheduler;
    /// # fn example(scheduler: TaskScheduler) {
    /// scheduler.pause();
    /// assert!(scheduler.is_paused());
    /// scheduler.resume();
    /// # }
    /// ```
    pub fn pause(&self) {
        if self.control.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.control.pause_generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.notifier.set_action(Some(NotificationAction::Resume));
        self.notifier.update(
            "Paused",
            format!("{} tasks waiting", self.store.latest().len()),
            None,
            true,
        );
        self.emit_event(Event::Paused);
        tracing::info!("Scheduler paused");

        if let Some(delay) = self.config.scheduler.auto_resume_after {
            let scheduler = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let current = scheduler.control.pause_generation.load(Ordering::SeqCst);
                if scheduler.is_paused() && current == generation {
                    tracing::info!(delay_ms = delay.as_millis() as u64, "Auto-resuming");
                    scheduler.resume();
                }
            });
        }
    }

    /// Resume dispatching, restarting the loop if tasks remain
    pub fn resume(&self) {
        if !self.control.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        self.notifier.set_action(Some(NotificationAction::Pause));
        self.emit_event(Event::Resumed);
        tracing::info!("Scheduler resumed");

        self.wake();
        if !self.store.latest().is_empty() {
            self.start();
        }
    }

    /// Whether dispatching is paused
    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::SeqCst)
    }

    /// Coarse state of the scheduler
    pub fn state(&self) -> SchedulerState {
        if !self.control.loop_active.load(Ordering::SeqCst) {
            SchedulerState::Idle
        } else if self.is_paused() {
            SchedulerState::Paused
        } else {
            SchedulerState::Running
        }
    }

    /// Cancel everything and clear the queue
    ///
    /// Every queued id is marked cancelled before the queue is emptied, so
    /// executors still running observe the cancellation. The run loop then
    /// winds down once in-flight downloads have unwound.
    pub async fn stop(&self) -> Result<()> {
        let removed = self.remove_where(|_| true).await?;
        tracing::info!(removed = removed.len(), "Scheduler stopped");
        Ok(())
    }

    /// Cancel the first queued task of `kind`
    ///
    /// Returns whether a task was found.
    pub async fn cancel_task(&self, kind: TaskKind) -> Result<bool> {
        let Some(id) = self
            .store
            .latest()
            .into_iter()
            .find(|t| t.kind() == kind)
            .map(|t| t.id)
        else {
            return Ok(false);
        };
        Ok(!self.remove_where(|t| t.id == id).await?.is_empty())
    }

    /// Remove (and cancel) one task
    ///
    /// Removing a novel download also removes its queued chapter downloads.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] when no queued task has this id.
    pub async fn remove_task_by_id(&self, id: &TaskId) -> Result<()> {
        let removed = self.remove_where(|t| &t.id == id).await?;
        if removed.is_empty() {
            return Err(Error::TaskNotFound(id.clone()));
        }
        Ok(())
    }

    /// Remove (and cancel) every task of `kind`; returns how many were removed
    pub async fn remove_tasks_by_kind(&self, kind: TaskKind) -> Result<usize> {
        Ok(self.remove_where(|t| t.kind() == kind).await?.len())
    }

    /// Remove (and cancel) chapter downloads matching `predicate`
    ///
    /// Parent novel downloads drop the removed chapters from their selection.
    pub async fn remove_downloads(
        &self,
        predicate: impl Fn(&DownloadChapterData) -> bool,
    ) -> Result<usize> {
        let removed = self
            .remove_where(|t| t.task.as_chapter().is_some_and(&predicate))
            .await?;
        Ok(removed.len())
    }

    /// Move a task to the front of the queue
    ///
    /// Goes to position 1 instead when the head task is executing.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] when no queued task has this id.
    pub async fn prioritize_task(&self, id: &TaskId) -> Result<()> {
        let moved = self.store.mutate(|queue, kinds| {
            let Some(index) = queue.iter().position(|t| &t.id == id) else {
                return false;
            };
            let target = insertion_point(queue);
            if index > target {
                let task = queue.remove(index);
                kinds.insert(task.kind());
                queue.insert(target, task);
            }
            true
        });
        if !moved {
            return Err(Error::TaskNotFound(id.clone()));
        }
        self.store.flush().await?;
        self.wake();
        Ok(())
    }

    /// Move chapter downloads matching `predicate` to the front, keeping their order
    ///
    /// Returns how many were moved.
    pub async fn promote_downloads(
        &self,
        predicate: impl Fn(&DownloadChapterData) -> bool,
    ) -> Result<usize> {
        let promoted = self.store.mutate(|queue, kinds| {
            let target = insertion_point(queue);
            let head: Vec<QueuedTask> = queue.drain(..target).collect();
            let (matching, rest): (Vec<QueuedTask>, Vec<QueuedTask>) = queue
                .drain(..)
                .partition(|t| t.task.as_chapter().is_some_and(&predicate));
            let promoted = matching.len();
            if promoted > 0 {
                kinds.insert(TaskKind::DownloadChapter);
            }
            queue.extend(head);
            queue.extend(matching);
            queue.extend(rest);
            promoted
        });
        if promoted > 0 {
            self.store.flush().await?;
            self.wake();
        }
        Ok(promoted)
    }

    /// Register a listener for the first task of `kind`
    ///
    /// Called after every flush that touched that kind. Chapter download
    /// flushes are not reported here; use [`observe_all`](Self::observe_all).
    pub fn observe(
        &self,
        kind: TaskKind,
        listener: impl Fn(Option<&QueuedTask>) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.observe(kind, listener)
    }

    /// Register a listener for the whole queue, called after every flush
    pub fn observe_all(
        &self,
        listener: impl Fn(&[QueuedTask]) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.observe_all(listener)
    }

    /// Keep the run alive while the user is reading
    ///
    /// While set, an empty queue does not end the run and no summary
    /// notification is shown.
    pub fn set_reading_session(&self, active: bool) {
        self.control.reading_session.store(active, Ordering::SeqCst);
        self.wake();
    }

    /// Stop starting chapter downloads from this plugin
    pub async fn pause_plugin(&self, plugin_id: &str) -> Result<()> {
        let snapshot = {
            let mut plugins = self.control.paused_plugins.lock();
            if !plugins.insert(plugin_id.to_string()) {
                return Ok(());
            }
            sorted(&plugins)
        };
        tracing::info!(plugin_id, "Plugin paused");
        self.persist_list(PAUSED_PLUGINS_KEY, &snapshot).await
    }

    /// Allow chapter downloads from this plugin again
    pub async fn resume_plugin(&self, plugin_id: &str) -> Result<()> {
        let snapshot = {
            let mut plugins = self.control.paused_plugins.lock();
            if !plugins.remove(plugin_id) {
                return Ok(());
            }
            sorted(&plugins)
        };
        tracing::info!(plugin_id, "Plugin resumed");
        self.persist_list(PAUSED_PLUGINS_KEY, &snapshot).await?;
        self.wake();
        Ok(())
    }

    /// Stop starting chapter downloads of this novel
    pub async fn pause_novel(&self, novel_id: NovelId) -> Result<()> {
        let snapshot = {
            let mut novels = self.control.paused_novels.lock();
            if !novels.insert(novel_id) {
                return Ok(());
            }
            sorted(&novels)
        };
        tracing::info!(novel_id, "Novel paused");
        self.persist_list(PAUSED_NOVELS_KEY, &snapshot).await
    }

    /// Allow chapter downloads of this novel again
    pub async fn resume_novel(&self, novel_id: NovelId) -> Result<()> {
        let snapshot = {
            let mut novels = self.control.paused_novels.lock();
            if !novels.remove(&novel_id) {
                return Ok(());
            }
            sorted(&novels)
        };
        tracing::info!(novel_id, "Novel resumed");
        self.persist_list(PAUSED_NOVELS_KEY, &snapshot).await?;
        self.wake();
        Ok(())
    }

    /// Currently paused plugin ids, sorted
    pub fn paused_plugins(&self) -> Vec<String> {
        sorted(&self.control.paused_plugins.lock())
    }

    /// Currently paused novel ids, sorted
    pub fn paused_novels(&self) -> Vec<NovelId> {
        sorted(&self.control.paused_novels.lock())
    }

    async fn persist_list<T: Serialize>(&self, key: &str, ids: &[T]) -> Result<()> {
        let value = serde_json::to_value(ids)?;
        self.kv.set(key, &value).await
    }

    /// Cancel and remove every task matching `predicate`
    ///
    /// Chapter downloads of a removed novel download are removed with it, and
    /// surviving novel downloads forget removed chapters. Ids are marked
    /// cancelled before the queue changes.
    pub(crate) async fn remove_where(
        &self,
        predicate: impl Fn(&QueuedTask) -> bool,
    ) -> Result<Vec<QueuedTask>> {
        let queue = self.store.latest();
        let removed_novels: HashSet<NovelId> = queue
            .iter()
            .filter(|t| predicate(t))
            .filter_map(|t| t.task.as_novel().map(|n| n.novel_id))
            .collect();
        let doomed = |t: &QueuedTask| {
            predicate(t)
                || t.task
                    .as_chapter()
                    .is_some_and(|c| removed_novels.contains(&c.novel_id))
        };

        let ids: Vec<TaskId> = queue.iter().filter(|t| doomed(t)).map(|t| t.id.clone()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.mark_cancelled(&ids);
        let ids: HashSet<TaskId> = ids.into_iter().collect();

        let removed = self.store.mutate(|queue, kinds| {
            let (removed, kept): (Vec<QueuedTask>, Vec<QueuedTask>) =
                queue.drain(..).partition(|t| ids.contains(&t.id));
            *queue = kept;
            for task in &removed {
                kinds.insert(task.kind());
                let Task::DownloadChapter(chapter) = &task.task else {
                    continue;
                };
                for parent in queue.iter_mut() {
                    if let Task::DownloadNovel(novel) = &mut parent.task
                        && novel.novel_id == chapter.novel_id
                    {
                        novel.forget_chapter(chapter.chapter_id);
                    }
                }
            }
            removed
        });

        self.store.flush().await?;
        for task in &removed {
            tracing::debug!(task_id = %task.id, kind = %task.kind(), "Task removed");
            self.emit_event(Event::TaskCancelled {
                id: task.id.clone(),
            });
        }
        self.wake();
        Ok(removed)
    }
}

/// Index where promoted tasks go: behind an executing head
fn insertion_point(queue: &[QueuedTask]) -> usize {
    match queue.first() {
        Some(head) if head.meta.is_running => 1,
        _ => 0,
    }
}

fn sorted<T: Ord + Clone>(set: &HashSet<T>) -> Vec<T> {
    let mut items: Vec<T> = set.iter().cloned().collect();
    items.sort();
    items
}
