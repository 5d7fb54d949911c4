//! Task execution strategies
//!
//! [`Executors`] has one required method per dispatchable task kind, and
//! [`dispatch`] selects it with an exhaustive match, so adding a [`Task`]
//! variant fails to compile until it has an executor.
//!
//! - [`context`] - Per-execution handle: cancellation, progress, follow-up tasks
//! - [`standard`] - Executors built on the library, plugin, tracker and speech collaborators

mod context;
mod standard;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use context::{ExecutionContext, ProgressReporter, TaskSender};
pub use standard::{Services, SpeechEngine, StandardExecutors, TrackedNovel, TrackerClient};

use crate::error::{Error, Result};
use crate::types::{
    BackupData, DownloadChapterData, ImportEpubData, MassImportData, MigrateNovelData,
    RestoreData, Task, TaskKind, TaskOutput, TrackerSyncData, TtsData, UpdateLibraryData,
};

/// One execution strategy per task kind
///
/// Implementations poll [`ExecutionContext::check_cancelled`] between units of
/// work and report progress through [`ExecutionContext::report`], which may be
/// called at any rate.
#[async_trait::async_trait]
pub trait Executors: Send + Sync {
    /// Refresh library novels from their sources
    async fn update_library(
        &self,
        data: &UpdateLibraryData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput>;

    /// Fetch and store one chapter
    async fn download_chapter(
        &self,
        data: &DownloadChapterData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput>;

    /// Export the library
    async fn backup(&self, data: &BackupData, ctx: &ExecutionContext) -> Result<TaskOutput>;

    /// Import a backup
    async fn restore(&self, data: &RestoreData, ctx: &ExecutionContext) -> Result<TaskOutput>;

    /// Add several novels
    async fn mass_import(
        &self,
        data: &MassImportData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput>;

    /// Synchronise with trackers
    async fn tracker_sync(
        &self,
        data: &TrackerSyncData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput>;

    /// Read a chapter aloud
    async fn tts(&self, data: &TtsData, ctx: &ExecutionContext) -> Result<TaskOutput>;

    /// Move a novel to another source
    async fn migrate_novel(
        &self,
        data: &MigrateNovelData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput>;

    /// Import a local EPUB
    async fn import_epub(
        &self,
        data: &ImportEpubData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput>;
}

/// Run `task` with its executor
///
/// Novel downloads are driven by the coordinator's expansion and are rejected
/// with [`Error::NotDispatchable`].
pub async fn dispatch(
    executors: &dyn Executors,
    task: &Task,
    ctx: &ExecutionContext,
) -> Result<TaskOutput> {
    match task {
        Task::UpdateLibrary(data) => executors.update_library(data, ctx).await,
        Task::DownloadChapter(data) => executors.download_chapter(data, ctx).await,
        Task::DownloadNovel(_) => Err(Error::NotDispatchable(TaskKind::DownloadNovel)),
        Task::Backup(data) => executors.backup(data, ctx).await,
        Task::Restore(data) => executors.restore(data, ctx).await,
        Task::MassImport(data) => executors.mass_import(data, ctx).await,
        Task::TrackerSync(data) => executors.tracker_sync(data, ctx).await,
        Task::Tts(data) => executors.tts(data, ctx).await,
        Task::MigrateNovel(data) => executors.migrate_novel(data, ctx).await,
        Task::ImportEpub(data) => executors.import_epub(data, ctx).await,
    }
}
