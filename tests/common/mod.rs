//! Shared fixtures for scheduler integration tests
//!
//! Everything here goes through the public API only.

#![allow(dead_code)]

use novel_tasks::library::{AddedNovel, ChapterRecord, Library, NovelRecord};
use novel_tasks::plugin::SourceNovel;
use novel_tasks::{
    BackupData, ChapterId, Config, DownloadChapterData, Error, Event, ExecutionContext, Executors,
    ImportEpubData, MassImportData, MigrateNovelData, NovelId, RestoreData, Result, TaskOutput,
    TrackerSyncData, TtsData, UpdateLibraryData,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

/// Library holding novels and chapters in memory
#[derive(Default)]
pub struct InMemoryLibrary {
    novels: Mutex<BTreeMap<NovelId, NovelRecord>>,
    chapters: Mutex<BTreeMap<ChapterId, ChapterRecord>>,
}

impl InMemoryLibrary {
    /// Add a novel with `count` undownloaded chapters
    pub fn with_novel(self, id: NovelId, plugin_id: &str, count: usize) -> Self {
        self.novels.lock().unwrap().insert(
            id,
            NovelRecord {
                id,
                plugin_id: plugin_id.to_string(),
                path: format!("novel-{id}"),
                name: format!("Novel {id}"),
            },
        );
        let mut chapters = self.chapters.lock().unwrap();
        for i in 1..=count {
            let chapter_id = id * 1000 + i as ChapterId;
            chapters.insert(
                chapter_id,
                ChapterRecord {
                    id: chapter_id,
                    novel_id: id,
                    name: format!("Chapter {i}"),
                    path: format!("novel-{id}/chapter-{i}"),
                    is_downloaded: false,
                    unread: true,
                },
            );
        }
        drop(chapters);
        self
    }

    pub fn downloaded(&self, novel_id: NovelId) -> usize {
        self.chapters
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.novel_id == novel_id && c.is_downloaded)
            .count()
    }
}

fn unsupported<T>(what: &str) -> Result<T> {
    Err(Error::Other(format!("{what} is not supported here")))
}

#[async_trait::async_trait]
impl Library for InMemoryLibrary {
    async fn novel(&self, id: NovelId) -> Result<NovelRecord> {
        self.novels
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NovelNotFound(id))
    }

    async fn library_novels(&self, _category_id: Option<i64>) -> Result<Vec<NovelRecord>> {
        Ok(self.novels.lock().unwrap().values().cloned().collect())
    }

    async fn chapters(&self, novel_id: NovelId) -> Result<Vec<ChapterRecord>> {
        Ok(self
            .chapters
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.novel_id == novel_id)
            .cloned()
            .collect())
    }

    async fn chapter(&self, id: ChapterId) -> Result<ChapterRecord> {
        self.chapters
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::ChapterNotFound(id))
    }

    async fn save_chapter(&self, id: ChapterId, _content: &str) -> Result<()> {
        let mut chapters = self.chapters.lock().unwrap();
        let chapter = chapters.get_mut(&id).ok_or(Error::ChapterNotFound(id))?;
        chapter.is_downloaded = true;
        Ok(())
    }

    async fn chapter_content(&self, _id: ChapterId) -> Result<String> {
        unsupported("chapter_content")
    }

    async fn add_novel(&self, _plugin_id: &str, _novel: &SourceNovel) -> Result<AddedNovel> {
        unsupported("add_novel")
    }

    async fn refresh_novel(&self, _id: NovelId, _novel: &SourceNovel) -> Result<Vec<ChapterRecord>> {
        unsupported("refresh_novel")
    }

    async fn migrate_progress(&self, _from: NovelId, _to: NovelId) -> Result<()> {
        unsupported("migrate_progress")
    }

    async fn export_backup(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    async fn import_backup(&self, _backup: &serde_json::Value) -> Result<usize> {
        unsupported("import_backup")
    }

    async fn import_epub(&self, _path: &Path) -> Result<NovelId> {
        unsupported("import_epub")
    }
}

/// Executors that record what ran, in order
///
/// Chapter downloads mark the chapter downloaded in the shared library after
/// `download_delay`; every other kind finishes immediately.
pub struct RecordingExecutors {
    pub library: std::sync::Arc<InMemoryLibrary>,
    pub download_delay: Duration,
    log: Mutex<Vec<String>>,
}

impl RecordingExecutors {
    pub fn new(library: std::sync::Arc<InMemoryLibrary>, download_delay: Duration) -> Self {
        Self {
            library,
            download_delay,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

#[async_trait::async_trait]
impl Executors for RecordingExecutors {
    async fn update_library(
        &self,
        _data: &UpdateLibraryData,
        _ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        self.record("update_library");
        Ok(TaskOutput::Done(None))
    }

    async fn download_chapter(
        &self,
        data: &DownloadChapterData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        self.record(format!("chapter:{}", data.chapter_id));
        tokio::select! {
            _ = ctx.cancellation().cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(self.download_delay) => {}
        }
        self.library.save_chapter(data.chapter_id, "content").await?;
        Ok(TaskOutput::Done(None))
    }

    async fn backup(&self, _data: &BackupData, _ctx: &ExecutionContext) -> Result<TaskOutput> {
        self.record("backup");
        Ok(TaskOutput::Done(Some(serde_json::json!({ "novels": 1 }))))
    }

    async fn restore(&self, _data: &RestoreData, _ctx: &ExecutionContext) -> Result<TaskOutput> {
        self.record("restore");
        Ok(TaskOutput::Done(None))
    }

    async fn mass_import(
        &self,
        _data: &MassImportData,
        _ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        self.record("mass_import");
        Ok(TaskOutput::Done(None))
    }

    async fn tracker_sync(
        &self,
        _data: &TrackerSyncData,
        _ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        self.record("tracker_sync");
        Err(Error::Tracker("tracker offline".into()))
    }

    async fn tts(&self, _data: &TtsData, _ctx: &ExecutionContext) -> Result<TaskOutput> {
        self.record("tts");
        Ok(TaskOutput::Done(None))
    }

    async fn migrate_novel(
        &self,
        _data: &MigrateNovelData,
        _ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        self.record("migrate_novel");
        Ok(TaskOutput::Done(None))
    }

    async fn import_epub(
        &self,
        _data: &ImportEpubData,
        _ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        self.record("import_epub");
        Ok(TaskOutput::Done(None))
    }
}

/// Config with no spacing between downloads, a fast loop and a database under `dir`
pub fn fast_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.download.base_delay = Duration::ZERO;
    config.download.min_jitter = Duration::ZERO;
    config.download.max_jitter = Duration::ZERO;
    config.download.max_concurrent_per_plugin = 2;
    config.scheduler.poll_interval = Duration::from_millis(10);
    config.scheduler.poll_jitter = Duration::from_millis(5);
    config.persistence.database_path = dir.join("tasks.db");
    config.persistence.write_debounce = Duration::from_millis(20);
    config.notifications.min_interval = Duration::from_millis(10);
    config.notifications.max_interval = Duration::from_millis(20);
    config
}

/// Receive events until `done` matches one, returning everything seen
pub async fn collect_until(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut done: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = done(&event);
                    seen.push(event);
                    if finished {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for event, saw: {seen:?}");
    seen
}
