//! Adding tasks to the queue.

use crate::error::Result;
use crate::types::{Event, QueuedTask, Task, TaskId, TaskKind};
use std::collections::HashSet;

use super::TaskScheduler;

impl TaskScheduler {
    /// Add one task to the queue
    ///
    /// Returns the new task's id, or `None` when the task was dropped because
    /// an instance of a non-multiplicable kind is already queued or running.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`](crate::Error::ShuttingDown) after [`shutdown`](Self::shutdown).
    pub async fn add_task(&self, task: Task) -> Result<Option<TaskId>> {
        Ok(self.add_tasks(vec![task]).await?.into_iter().next())
    }

    /// Add several tasks in one persisted update
    ///
    /// Each task is checked against the duplicate rule, against the queue and
    /// against earlier tasks of the same batch. Accepted tasks are written
    /// together and the scheduler is started if it is not running.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use novel_tasks::{TaskScheduler, Task, UpdateLibraryData, BackupData};
    /// # async fn example(scheduler: TaskScheduler) -> novel_tasks::Result<()> {
    /// let ids = scheduler
    ///     .add_tasks(vec![
    ///         Task::UpdateLibrary(UpdateLibraryData::default()),
    ///         Task::Backup(BackupData { target_dir: "/backups".into() }),
    ///     ])
    ///     .await?;
    /// assert!(ids.len() <= 2);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn add_tasks(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>> {
        self.ensure_accepting()?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let accepted = self.store.mutate(|queue, kinds| {
            let mut present: HashSet<TaskKind> = queue.iter().map(QueuedTask::kind).collect();
            let mut accepted = Vec::new();
            for task in tasks {
                let kind = task.kind();
                if !kind.is_multiplicable() && present.contains(&kind) {
                    tracing::debug!(kind = %kind, "Dropping duplicate task");
                    continue;
                }
                present.insert(kind);
                kinds.insert(kind);
                let queued = QueuedTask::new(task);
                accepted.push((queued.id.clone(), kind));
                queue.push(queued);
            }
            accepted
        });

        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        self.store.flush().await?;

        for (id, kind) in &accepted {
            tracing::debug!(task_id = %id, kind = %kind, "Task queued");
            self.emit_event(Event::TaskQueued {
                id: id.clone(),
                kind: *kind,
            });
        }

        self.start();
        Ok(accepted.into_iter().map(|(id, _)| id).collect())
    }

    /// Move follow-up tasks sent by executors into the queue
    pub(crate) async fn drain_follow_ups(&self) -> Result<()> {
        let batches: Vec<Vec<Task>> = {
            let mut rx = self.spawn_rx.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let tasks: Vec<Task> = batches.into_iter().flatten().collect();
        if tasks.is_empty() {
            return Ok(());
        }
        self.add_tasks(tasks).await.map(|_| ())
    }
}
