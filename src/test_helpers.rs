//! Shared in-memory collaborators for unit tests.

use crate::config::{Config, RetryConfig};
use crate::db::{KeyValueStore, MemoryStore};
use crate::error::{Error, Result};
use crate::executors::{
    ExecutionContext, ProgressReporter, Services, SpeechEngine, StandardExecutors, TaskSender,
    TrackedNovel, TrackerClient,
};
use crate::library::{AddedNovel, ChapterRecord, Library, NovelRecord};
use crate::notification::{Notification, NotificationSink, ThrottledNotifier};
use crate::plugin::{NovelItem, Plugin, PluginRegistry, PopularOptions, SourceChapter, SourceNovel};
use crate::scheduler::{Collaborators, TaskScheduler};
use crate::task_store::TaskStore;
use crate::types::{ChapterId, NovelId, QueuedTask, SyncDirection, Task};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct LibraryState {
    novels: BTreeMap<NovelId, NovelRecord>,
    categories: HashMap<NovelId, i64>,
    chapters: BTreeMap<ChapterId, ChapterRecord>,
    contents: HashMap<ChapterId, String>,
    migrations: Vec<(NovelId, NovelId)>,
    next_novel_id: NovelId,
    next_chapter_id: ChapterId,
}

impl LibraryState {
    fn insert_novel(&mut self, plugin_id: &str, path: &str, name: &str) -> NovelId {
        self.next_novel_id += 1;
        let id = self.next_novel_id;
        self.novels.insert(
            id,
            NovelRecord {
                id,
                plugin_id: plugin_id.to_string(),
                path: path.to_string(),
                name: name.to_string(),
            },
        );
        id
    }

    fn insert_chapter(&mut self, novel_id: NovelId, name: &str, path: &str) -> ChapterRecord {
        self.next_chapter_id += 1;
        let chapter = ChapterRecord {
            id: self.next_chapter_id,
            novel_id,
            name: name.to_string(),
            path: path.to_string(),
            is_downloaded: false,
            unread: true,
        };
        self.chapters.insert(chapter.id, chapter.clone());
        chapter
    }
}

/// Library kept in memory
#[derive(Default)]
pub(crate) struct MemoryLibrary {
    state: Mutex<LibraryState>,
    saves: AtomicUsize,
}

impl MemoryLibrary {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a novel with `chapters` unread, undownloaded chapters
    pub(crate) fn add_test_novel(
        &self,
        plugin_id: &str,
        name: &str,
        chapters: usize,
    ) -> (NovelId, Vec<ChapterId>) {
        let mut state = self.state.lock();
        let path = format!("novel-{}", state.next_novel_id + 1);
        let novel_id = state.insert_novel(plugin_id, &path, name);
        let ids = (1..=chapters)
            .map(|i| {
                state
                    .insert_chapter(novel_id, &format!("Chapter {i}"), &format!("{path}/chapter-{i}"))
                    .id
            })
            .collect();
        (novel_id, ids)
    }

    pub(crate) fn set_category(&self, novel_id: NovelId, category: i64) {
        self.state.lock().categories.insert(novel_id, category);
    }

    pub(crate) fn mark_downloaded(&self, id: ChapterId) {
        if let Some(chapter) = self.state.lock().chapters.get_mut(&id) {
            chapter.is_downloaded = true;
        }
    }

    pub(crate) fn mark_read(&self, id: ChapterId) {
        if let Some(chapter) = self.state.lock().chapters.get_mut(&id) {
            chapter.unread = false;
        }
    }

    pub(crate) fn is_downloaded(&self, id: ChapterId) -> bool {
        self.state
            .lock()
            .chapters
            .get(&id)
            .is_some_and(|c| c.is_downloaded)
    }

    pub(crate) fn set_content(&self, id: ChapterId, content: &str) {
        let mut state = self.state.lock();
        state.contents.insert(id, content.to_string());
        if let Some(chapter) = state.chapters.get_mut(&id) {
            chapter.is_downloaded = true;
        }
    }

    pub(crate) fn novel_count(&self) -> usize {
        self.state.lock().novels.len()
    }

    pub(crate) fn migrations(&self) -> Vec<(NovelId, NovelId)> {
        self.state.lock().migrations.clone()
    }

    pub(crate) fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Library for MemoryLibrary {
    async fn novel(&self, id: NovelId) -> Result<NovelRecord> {
        self.state
            .lock()
            .novels
            .get(&id)
            .cloned()
            .ok_or(Error::NovelNotFound(id))
    }

    async fn library_novels(&self, category_id: Option<i64>) -> Result<Vec<NovelRecord>> {
        let state = self.state.lock();
        Ok(state
            .novels
            .values()
            .filter(|n| category_id.is_none() || state.categories.get(&n.id) == category_id.as_ref())
            .cloned()
            .collect())
    }

    async fn chapters(&self, novel_id: NovelId) -> Result<Vec<ChapterRecord>> {
        Ok(self
            .state
            .lock()
            .chapters
            .values()
            .filter(|c| c.novel_id == novel_id)
            .cloned()
            .collect())
    }

    async fn chapter(&self, id: ChapterId) -> Result<ChapterRecord> {
        self.state
            .lock()
            .chapters
            .get(&id)
            .cloned()
            .ok_or(Error::ChapterNotFound(id))
    }

    async fn save_chapter(&self, id: ChapterId, content: &str) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let chapter = state.chapters.get_mut(&id).ok_or(Error::ChapterNotFound(id))?;
        chapter.is_downloaded = true;
        state.contents.insert(id, content.to_string());
        Ok(())
    }

    async fn chapter_content(&self, id: ChapterId) -> Result<String> {
        self.state
            .lock()
            .contents
            .get(&id)
            .cloned()
            .ok_or(Error::ChapterNotFound(id))
    }

    async fn add_novel(&self, plugin_id: &str, novel: &SourceNovel) -> Result<AddedNovel> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .novels
            .values()
            .find(|n| n.plugin_id == plugin_id && n.path == novel.path)
        {
            return Ok(AddedNovel::Existing(existing.id));
        }
        let id = state.insert_novel(plugin_id, &novel.path, &novel.name);
        for chapter in &novel.chapters {
            state.insert_chapter(id, &chapter.name, &chapter.path);
        }
        Ok(AddedNovel::Added(id))
    }

    async fn refresh_novel(&self, id: NovelId, novel: &SourceNovel) -> Result<Vec<ChapterRecord>> {
        let mut state = self.state.lock();
        if !state.novels.contains_key(&id) {
            return Err(Error::NovelNotFound(id));
        }
        let known: HashSet<String> = state
            .chapters
            .values()
            .filter(|c| c.novel_id == id)
            .map(|c| c.path.clone())
            .collect();
        Ok(novel
            .chapters
            .iter()
            .filter(|c| !known.contains(&c.path))
            .map(|c| state.insert_chapter(id, &c.name, &c.path))
            .collect())
    }

    async fn migrate_progress(&self, from: NovelId, to: NovelId) -> Result<()> {
        self.state.lock().migrations.push((from, to));
        Ok(())
    }

    async fn export_backup(&self) -> Result<serde_json::Value> {
        let novels: Vec<NovelRecord> = self.state.lock().novels.values().cloned().collect();
        Ok(serde_json::json!({ "novels": novels }))
    }

    async fn import_backup(&self, backup: &serde_json::Value) -> Result<usize> {
        let novels: Vec<NovelRecord> = serde_json::from_value(backup["novels"].clone())?;
        let mut state = self.state.lock();
        let mut restored = 0;
        for novel in novels {
            let exists = state
                .novels
                .values()
                .any(|n| n.plugin_id == novel.plugin_id && n.path == novel.path);
            if !exists {
                state.insert_novel(&novel.plugin_id, &novel.path, &novel.name);
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn import_epub(&self, path: &Path) -> Result<NovelId> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Other(format!("not a file: {}", path.display())))?;
        Ok(self
            .state
            .lock()
            .insert_novel("local", &path.to_string_lossy(), &name))
    }
}

/// Plugin serving canned novels and chapter bodies
pub(crate) struct ScriptedPlugin {
    id: String,
    novels: Vec<SourceNovel>,
    failing: HashMap<String, String>,
    delay: Duration,
    chapter_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedPlugin {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            novels: Vec::new(),
            failing: HashMap::new(),
            delay: Duration::ZERO,
            chapter_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_novel(mut self, path: &str, name: &str, chapters: &[&str]) -> Self {
        self.novels.push(SourceNovel {
            path: path.to_string(),
            name: name.to_string(),
            chapters: chapters
                .iter()
                .map(|c| SourceChapter {
                    name: c.to_string(),
                    path: format!("{path}/{c}"),
                })
                .collect(),
        });
        self
    }

    /// Every request for `path` fails with `message`
    pub(crate) fn failing_on(mut self, path: &str, message: &str) -> Self {
        self.failing.insert(path.to_string(), message.to_string());
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn chapter_calls(&self) -> usize {
        self.chapter_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check(&self, path: &str) -> Result<()> {
        match self.failing.get(path) {
            Some(message) => Err(Error::plugin(&self.id, message)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Plugin for ScriptedPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    async fn popular_novels(&self, page: u32, _options: &PopularOptions) -> Result<Vec<NovelItem>> {
        if page > 1 {
            return Ok(Vec::new());
        }
        Ok(self
            .novels
            .iter()
            .map(|n| NovelItem {
                name: n.name.clone(),
                path: n.path.clone(),
                cover: None,
            })
            .collect())
    }

    async fn search_novels(&self, text: &str, page: u32) -> Result<Vec<NovelItem>> {
        let page_one = self.popular_novels(page, &PopularOptions::default()).await?;
        Ok(page_one
            .into_iter()
            .filter(|n| n.name.to_lowercase().contains(&text.to_lowercase()))
            .collect())
    }

    async fn parse_novel(&self, path: &str) -> Result<SourceNovel> {
        self.check(path)?;
        self.novels
            .iter()
            .find(|n| n.path == path)
            .cloned()
            .ok_or_else(|| Error::plugin(&self.id, format!("novel not found: {path}")))
    }

    async fn parse_chapter(&self, path: &str) -> Result<String> {
        self.chapter_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.check(path)?;
        Ok(format!("<p>Content of {path}</p>"))
    }
}

/// Sink that remembers what it was asked to show
#[derive(Default)]
pub(crate) struct RecordingSink {
    delivered: Mutex<Vec<Notification>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingSink {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub(crate) fn notifications(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn titles(&self) -> Vec<String> {
        self.delivered.lock().iter().map(|n| n.title.clone()).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn deliver(&self, notification: &Notification) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Other("notification surface unavailable".into()));
        }
        self.delivered.lock().push(notification.clone());
        Ok(())
    }
}

/// Tracker with canned per-novel outcomes
#[derive(Default)]
pub(crate) struct FakeTrackers {
    pub(crate) tracked: Vec<TrackedNovel>,
    /// `None` fails the sync
    pub(crate) outcomes: HashMap<NovelId, Option<bool>>,
}

#[async_trait::async_trait]
impl TrackerClient for FakeTrackers {
    async fn tracked(&self) -> Result<Vec<TrackedNovel>> {
        Ok(self.tracked.clone())
    }

    async fn sync(&self, novel: &TrackedNovel, _direction: SyncDirection) -> Result<bool> {
        match self.outcomes.get(&novel.novel_id).copied().flatten() {
            Some(changed) => Ok(changed),
            None => Err(Error::Tracker(format!("{} rejected the update", novel.tracker))),
        }
    }
}

/// Speech engine that records what it read
#[derive(Default)]
pub(crate) struct RecordingSpeech {
    spoken: Mutex<Vec<String>>,
}

impl RecordingSpeech {
    pub(crate) fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }
}

#[async_trait::async_trait]
impl SpeechEngine for RecordingSpeech {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().push(text.to_string());
        Ok(())
    }
}

pub(crate) fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Collaborators for executor tests
pub(crate) struct TestServices {
    pub(crate) library: Arc<MemoryLibrary>,
    pub(crate) plugins: Vec<Arc<ScriptedPlugin>>,
    pub(crate) trackers: Arc<FakeTrackers>,
    pub(crate) speech: Arc<RecordingSpeech>,
}

impl TestServices {
    pub(crate) fn new(library: Arc<MemoryLibrary>, plugins: Vec<ScriptedPlugin>) -> Self {
        Self {
            library,
            plugins: plugins.into_iter().map(Arc::new).collect(),
            trackers: Arc::new(FakeTrackers::default()),
            speech: Arc::new(RecordingSpeech::default()),
        }
    }

    pub(crate) fn services(&self) -> Services {
        let mut registry = PluginRegistry::new();
        for plugin in &self.plugins {
            registry.register(plugin.clone());
        }
        Services {
            library: self.library.clone(),
            plugins: Arc::new(registry),
            trackers: self.trackers.clone(),
            speech: self.speech.clone(),
        }
    }

    pub(crate) fn executors(&self, download_new_chapters: bool) -> StandardExecutors {
        StandardExecutors::new(self.services(), fast_retry(), download_new_chapters)
    }
}

/// A standalone execution context over a one-task queue
pub(crate) struct TestContext {
    pub(crate) ctx: ExecutionContext,
    pub(crate) store: TaskStore,
    pub(crate) cancel: CancellationToken,
    pub(crate) follow_ups: mpsc::UnboundedReceiver<Vec<Task>>,
}

pub(crate) async fn test_context(task: &QueuedTask) -> TestContext {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let store = TaskStore::load(kv, Duration::from_secs(60)).await.unwrap();
    store.replace(vec![task.clone()], Some(task.kind()));
    store.flush().await.unwrap();

    let notifier = ThrottledNotifier::new(
        Default::default(),
        Arc::new(RecordingSink::default()),
    );
    let (event_tx, _rx) = tokio::sync::broadcast::channel(100);
    let (tx, follow_ups) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let progress = ProgressReporter::new(
        task.id.clone(),
        task.meta.name.clone(),
        store.clone(),
        notifier,
        event_tx,
    );
    let ctx = ExecutionContext::new(task.id.clone(), cancel.clone(), progress, TaskSender::new(tx));

    TestContext {
        ctx,
        store,
        cancel,
        follow_ups,
    }
}

/// Config with no spacing between downloads and a fast loop
pub(crate) fn fast_config() -> Config {
    let mut config = Config::default();
    config.download.base_delay = Duration::ZERO;
    config.download.min_jitter = Duration::ZERO;
    config.download.max_jitter = Duration::ZERO;
    config.scheduler.poll_interval = Duration::from_millis(10);
    config.scheduler.poll_jitter = Duration::from_millis(5);
    config.persistence.write_debounce = Duration::from_millis(20);
    config.notifications.min_interval = Duration::from_millis(10);
    config.notifications.max_interval = Duration::from_millis(20);
    config.retry = fast_retry();
    config
}

/// Everything a scheduler test needs a handle on
pub(crate) struct TestScheduler {
    pub(crate) scheduler: TaskScheduler,
    pub(crate) kv: Arc<MemoryStore>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) services: TestServices,
}

pub(crate) async fn create_test_scheduler(
    config: Config,
    services: TestServices,
    kv: Arc<MemoryStore>,
) -> TestScheduler {
    let sink = Arc::new(RecordingSink::default());
    let executors = Arc::new(services.executors(config.download.download_new_chapters));
    let scheduler = TaskScheduler::new(
        config,
        Collaborators {
            kv: kv.clone(),
            library: services.library.clone(),
            executors,
            sink: sink.clone(),
            network: None,
        },
    )
    .await
    .unwrap();

    TestScheduler {
        scheduler,
        kv,
        sink,
        services,
    }
}
