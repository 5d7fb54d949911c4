//! Chapter downloads: spawned off the loop, finished on their own task.

use crate::coordinator::DownloadOutcome;
use crate::error::Result;
use crate::executors::dispatch;
use crate::types::{
    DownloadChapterData, Event, QueuedTask, Task, TaskKind, TaskMetadata, TaskOutput,
};

use super::{InFlightGuard, TaskScheduler};

impl TaskScheduler {
    /// Spawn a chapter download; returns false when it was cancelled first
    pub(crate) fn start_chapter(&self, task: QueuedTask, chapter: DownloadChapterData) -> bool {
        let Some(token) = self.register_execution(&task.id) else {
            return false;
        };

        self.coordinator
            .start_download(task.id.clone(), &chapter.plugin_id);
        self.store.update_meta(&task.id, |meta| TaskMetadata {
            is_running: true,
            ..meta
        });

        tracing::debug!(
            task_id = %task.id,
            plugin_id = %chapter.plugin_id,
            chapter_id = chapter.chapter_id,
            "Starting chapter download"
        );
        self.emit_event(Event::TaskStarted {
            id: task.id.clone(),
            kind: TaskKind::DownloadChapter,
        });

        let title = self.run.lock().title(&task);
        self.notifier
            .update(title.clone(), chapter.chapter_name.clone(), None, false);

        let guard = InFlightGuard::new(&self.control);
        let scheduler = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let ctx = scheduler.execution_context(&task.id, title, token);
            let result = dispatch(scheduler.executors.as_ref(), &task.task, &ctx).await;
            scheduler.finish_chapter(&task, &chapter, result).await;
        });
        true
    }

    /// Record a finished chapter download
    ///
    /// Prunes the chapter task and patches its parent novel download in the
    /// same store update, so the next expansion sees both changes together.
    async fn finish_chapter(
        &self,
        task: &QueuedTask,
        chapter: &DownloadChapterData,
        result: Result<TaskOutput>,
    ) {
        let id = &task.id;
        let cancelled =
            self.is_cancelled(id) || result.as_ref().is_err_and(|e| e.is_cancelled());

        let outcome = match &result {
            _ if cancelled => DownloadOutcome::Failed,
            Ok(TaskOutput::Done(_)) => DownloadOutcome::Completed,
            Ok(TaskOutput::Skipped) => DownloadOutcome::Skipped,
            Err(_) => DownloadOutcome::Failed,
        };
        self.coordinator
            .finish_download(id, &chapter.plugin_id, outcome);

        match result {
            _ if cancelled => {
                tracing::debug!(
                    task_id = %id,
                    chapter_id = chapter.chapter_id,
                    "Chapter download cancelled"
                );
            }
            Ok(TaskOutput::Done(result)) => {
                self.run
                    .lock()
                    .summary
                    .record_completed(TaskKind::DownloadChapter);
                self.emit_event(Event::TaskCompleted {
                    id: id.clone(),
                    kind: TaskKind::DownloadChapter,
                    result,
                });
            }
            Ok(TaskOutput::Skipped) => {
                self.run.lock().summary.skipped += 1;
                self.emit_event(Event::TaskSkipped {
                    id: id.clone(),
                    kind: TaskKind::DownloadChapter,
                });
            }
            Err(e) => {
                self.run.lock().summary.failed += 1;
                tracing::error!(
                    task_id = %id,
                    plugin_id = %chapter.plugin_id,
                    chapter_id = chapter.chapter_id,
                    error = %e,
                    "Chapter download failed"
                );
                self.notifier
                    .notify_once(format!("{} failed", task.meta.name), e.to_string());
                self.emit_event(Event::TaskFailed {
                    id: id.clone(),
                    kind: TaskKind::DownloadChapter,
                    error: e.to_string(),
                });
            }
        }

        let succeeded = outcome != DownloadOutcome::Failed;
        self.store.mutate(|queue, kinds| {
            queue.retain(|t| &t.id != id);
            kinds.insert(TaskKind::DownloadChapter);
            for parent in queue.iter_mut() {
                let Task::DownloadNovel(novel) = &mut parent.task else {
                    continue;
                };
                if novel.novel_id != chapter.novel_id {
                    continue;
                }
                if cancelled {
                    novel.forget_chapter(chapter.chapter_id);
                } else {
                    novel.record_chapter_outcome(chapter.chapter_id, succeeded);
                }
                if novel.total_count > 0 {
                    let progress = novel.completed_count as f64 / novel.total_count as f64;
                    let text = format!("{}/{} chapters", novel.completed_count, novel.total_count);
                    parent.meta = std::mem::take(&mut parent.meta)
                        .with_progress(progress)
                        .with_text(text);
                }
                kinds.insert(TaskKind::DownloadNovel);
            }
        });

        self.release_execution(id);
        self.run.lock().finish(&task.task);
    }
}
