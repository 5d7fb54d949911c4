//! Executors built on the library, plugin, tracker and speech collaborators.

use super::{ExecutionContext, Executors};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::library::{AddedNovel, Library, NovelRecord};
use crate::plugin::{Plugin, PluginRegistry, SourceNovel};
use crate::retry::with_retry;
use crate::types::{
    BackupData, DownloadChapterData, ImportEpubData, ImportSource, MassImportData,
    MigrateNovelData, NovelId, RestoreData, SyncDirection, Task, TaskOutput, TrackerSyncData,
    TtsData, UpdateLibraryData,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, LazyLock};

/// A library novel linked to a tracker entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedNovel {
    /// Library novel
    pub novel_id: NovelId,
    /// Tracker name
    pub tracker: String,
    /// Entry id at the tracker
    pub remote_id: String,
    /// Display name
    pub name: String,
}

/// Reading-progress tracker services
#[async_trait::async_trait]
pub trait TrackerClient: Send + Sync {
    /// Novels linked to any tracker
    async fn tracked(&self) -> Result<Vec<TrackedNovel>>;

    /// Sync one novel; returns whether anything changed
    async fn sync(&self, novel: &TrackedNovel, direction: SyncDirection) -> Result<bool>;
}

/// Text-to-speech output
#[async_trait::async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Speak one passage, returning when it has been read
    async fn speak(&self, text: &str) -> Result<()>;
}

/// Collaborators the standard executors work against
#[derive(Clone)]
pub struct Services {
    /// Library store
    pub library: Arc<dyn Library>,
    /// Installed source plugins
    pub plugins: Arc<PluginRegistry>,
    /// Tracker services
    pub trackers: Arc<dyn TrackerClient>,
    /// Speech output
    pub speech: Arc<dyn SpeechEngine>,
}

/// Default executor set
pub struct StandardExecutors {
    services: Services,
    retry: RetryConfig,
    download_new_chapters: bool,
}

impl StandardExecutors {
    /// Create executors over `services`
    ///
    /// Plugin fetches and chapter writes are retried per `retry`. With
    /// `download_new_chapters`, a library update queues downloads for every
    /// chapter it discovers.
    pub fn new(services: Services, retry: RetryConfig, download_new_chapters: bool) -> Self {
        Self {
            services,
            retry,
            download_new_chapters,
        }
    }

    async fn parse_novel(&self, plugin: &Arc<dyn Plugin>, path: &str) -> Result<SourceNovel> {
        with_retry(&self.retry, || plugin.parse_novel(path)).await
    }

    async fn refresh(&self, novel: &NovelRecord) -> Result<Vec<Task>> {
        let plugin = self.services.plugins.require(&novel.plugin_id)?;
        let source = self.parse_novel(&plugin, &novel.path).await?;
        let fresh = self.services.library.refresh_novel(novel.id, &source).await?;

        Ok(fresh
            .into_iter()
            .map(|chapter| {
                Task::DownloadChapter(DownloadChapterData {
                    chapter_id: chapter.id,
                    novel_id: novel.id,
                    plugin_id: novel.plugin_id.clone(),
                    novel_name: novel.name.clone(),
                    chapter_name: chapter.name,
                })
            })
            .collect())
    }

    async fn import_one(&self, plugin_id: &str, source: &ImportSource) -> Result<AddedNovel> {
        let plugin = self.services.plugins.require(plugin_id)?;
        let path = match source {
            ImportSource::Path(path) => path.clone(),
            ImportSource::Search(query) => {
                let hits = with_retry(&self.retry, || plugin.search_novels(query, 1)).await?;
                hits.into_iter()
                    .next()
                    .map(|hit| hit.path)
                    .ok_or_else(|| Error::plugin(plugin_id, format!("no results for '{query}'")))?
            }
        };
        let novel = self.parse_novel(&plugin, &path).await?;
        self.services.library.add_novel(plugin_id, &novel).await
    }
}

fn fraction(done: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}

#[async_trait::async_trait]
impl Executors for StandardExecutors {
    async fn update_library(
        &self,
        data: &UpdateLibraryData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        let novels = self.services.library.library_novels(data.category_id).await?;
        let total = novels.len();
        let mut updated = 0usize;
        let mut new_chapters = 0usize;
        let mut failed = Vec::new();
        let mut downloads = Vec::new();

        for (index, novel) in novels.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.report(|meta| {
                meta.with_progress(fraction(index, total))
                    .with_text(format!("{} ({}/{})", novel.name, index + 1, total))
            });

            match self.refresh(novel).await {
                Ok(fresh) => {
                    updated += 1;
                    new_chapters += fresh.len();
                    if self.download_new_chapters {
                        downloads.extend(fresh);
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(novel_id = novel.id, plugin_id = %novel.plugin_id, error = %e, "Novel update failed");
                    failed.push(json!({ "novel": novel.name, "error": e.to_string() }));
                }
            }
        }

        if !downloads.is_empty() {
            tracing::info!(chapters = downloads.len(), "Queueing downloads for new chapters");
            ctx.enqueue(downloads);
        }

        Ok(TaskOutput::Done(Some(json!({
            "updated": updated,
            "newChapters": new_chapters,
            "failed": failed,
        }))))
    }

    async fn download_chapter(
        &self,
        data: &DownloadChapterData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        ctx.check_cancelled()?;
        let library = &self.services.library;

        let chapter = library.chapter(data.chapter_id).await?;
        if chapter.is_downloaded {
            tracing::debug!(chapter_id = data.chapter_id, "Chapter already downloaded");
            return Ok(TaskOutput::Skipped);
        }

        let plugin = self.services.plugins.require(&data.plugin_id)?;
        ctx.report(|meta| meta.with_text(format!("{} - {}", data.novel_name, data.chapter_name)));

        let content = with_retry(&self.retry, || plugin.parse_chapter(&chapter.path)).await?;
        ctx.check_cancelled()?;

        with_retry(&self.retry, || library.save_chapter(data.chapter_id, &content)).await?;
        Ok(TaskOutput::Done(None))
    }

    async fn backup(&self, data: &BackupData, ctx: &ExecutionContext) -> Result<TaskOutput> {
        ctx.report(|meta| meta.with_progress(0.0).with_text("Exporting library"));
        let backup = self.services.library.export_backup().await?;
        ctx.check_cancelled()?;

        tokio::fs::create_dir_all(&data.target_dir).await?;
        let file_name = format!(
            "novel-backup-{}.json",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        let path = data.target_dir.join(file_name);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&backup)?).await?;

        tracing::info!(path = %path.display(), "Backup written");
        Ok(TaskOutput::Done(Some(json!({ "path": path }))))
    }

    async fn restore(&self, data: &RestoreData, ctx: &ExecutionContext) -> Result<TaskOutput> {
        ctx.report(|meta| meta.with_progress(0.0).with_text("Reading backup"));
        let bytes = tokio::fs::read(&data.source).await?;
        let backup: serde_json::Value = serde_json::from_slice(&bytes)?;
        ctx.check_cancelled()?;

        ctx.report(|meta| meta.with_progress(0.5).with_text("Restoring library"));
        let restored = self.services.library.import_backup(&backup).await?;

        tracing::info!(restored, source = %data.source.display(), "Backup restored");
        Ok(TaskOutput::Done(Some(json!({ "restored": restored }))))
    }

    async fn mass_import(
        &self,
        data: &MassImportData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        let total = data.items.len();
        let mut added = 0usize;
        let mut skipped = 0usize;
        let mut errors = Vec::new();

        for (index, item) in data.items.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.report(|meta| {
                meta.with_progress(fraction(index, total))
                    .with_text(format!("{}/{}", index + 1, total))
            });

            match self.import_one(&item.plugin_id, &item.source).await {
                Ok(AddedNovel::Added(_)) => added += 1,
                Ok(AddedNovel::Existing(_)) => skipped += 1,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(plugin_id = %item.plugin_id, error = %e, "Import failed");
                    errors.push(json!({
                        "pluginId": item.plugin_id,
                        "source": item.source,
                        "error": e.to_string(),
                    }));
                }
            }
        }

        Ok(TaskOutput::Done(Some(json!({
            "added": added,
            "skipped": skipped,
            "errors": errors,
        }))))
    }

    async fn tracker_sync(
        &self,
        data: &TrackerSyncData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        let tracked = self.services.trackers.tracked().await?;
        let total = tracked.len();
        let mut updated = 0usize;
        let mut unchanged = 0usize;
        let mut failed = Vec::new();

        for (index, novel) in tracked.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.report(|meta| {
                meta.with_progress(fraction(index, total))
                    .with_text(novel.name.clone())
            });

            match self.services.trackers.sync(novel, data.direction).await {
                Ok(true) => updated += 1,
                Ok(false) => unchanged += 1,
                Err(e) => {
                    tracing::warn!(novel_id = novel.novel_id, tracker = %novel.tracker, error = %e, "Tracker sync failed");
                    failed.push(json!({ "novel": novel.name, "tracker": novel.tracker, "error": e.to_string() }));
                }
            }
        }

        Ok(TaskOutput::Done(Some(json!({
            "updated": updated,
            "unchanged": unchanged,
            "failed": failed,
        }))))
    }

    async fn tts(&self, data: &TtsData, ctx: &ExecutionContext) -> Result<TaskOutput> {
        let html = self.services.library.chapter_content(data.chapter_id).await?;
        let paragraphs = html_to_paragraphs(&html);
        let total = paragraphs.len();

        for (index, paragraph) in paragraphs.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.report(|meta| {
                meta.with_progress(fraction(index, total))
                    .with_text(format!("Paragraph {}/{}", index + 1, total))
            });
            self.services.speech.speak(paragraph).await?;
        }

        Ok(TaskOutput::Done(None))
    }

    async fn migrate_novel(
        &self,
        data: &MigrateNovelData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        let library = &self.services.library;
        let from = library.novel(data.from_novel_id).await?;
        let plugin = self.services.plugins.require(&data.to_plugin_id)?;

        ctx.report(|meta| meta.with_progress(0.0).with_text(format!("Fetching {}", from.name)));
        let source = self.parse_novel(&plugin, &data.to_path).await?;
        ctx.check_cancelled()?;

        let to = library.add_novel(&data.to_plugin_id, &source).await?.id();
        library.migrate_progress(from.id, to).await?;

        tracing::info!(from = from.id, to, plugin_id = %data.to_plugin_id, "Novel migrated");
        Ok(TaskOutput::Done(Some(json!({ "novelId": to }))))
    }

    async fn import_epub(
        &self,
        data: &ImportEpubData,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        ctx.check_cancelled()?;
        let novel_id = self.services.library.import_epub(&data.path).await?;
        Ok(TaskOutput::Done(Some(json!({ "novelId": novel_id }))))
    }
}

static BLOCK_BREAK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>|</h[1-6]\s*>").ok());
static TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]*>").ok());

/// Split chapter HTML into plain-text paragraphs
pub(crate) fn html_to_paragraphs(html: &str) -> Vec<String> {
    let mut text = html.to_string();
    if let Some(re) = BLOCK_BREAK.as_ref() {
        text = re.replace_all(&text, "\n").into_owned();
    }
    if let Some(re) = TAG.as_ref() {
        text = re.replace_all(&text, "").into_owned();
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}
