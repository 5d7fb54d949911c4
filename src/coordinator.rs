//! Download policy: novel expansion and chapter start gating
//!
//! A novel download never runs as one unit. Each loop iteration asks
//! [`DownloadCoordinator::expand_novel_task`] to top up a bounded number of
//! chapter downloads for it, and each chapter download must pass
//! [`DownloadCoordinator::can_start`] (pause lists, concurrency ceilings,
//! per-plugin spacing) before it is spawned.
//!
//! The active set and per-plugin counters live only in memory and are
//! rebuilt from the queue by [`DownloadCoordinator::reconcile_state`].

use crate::config::DownloadConfig;
use crate::error::Result;
use crate::library::{ChapterRecord, Library};
use crate::types::{
    ChapterId, DownloadChapterData, DownloadMode, DownloadNovelData, NovelId, QueuedTask, Task,
    TaskId,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one expansion of a novel download
#[derive(Clone, Debug, PartialEq)]
pub struct Expansion {
    /// Novel payload with refreshed runtime state
    pub updated: DownloadNovelData,
    /// Nothing pending and no chapter download of this novel left in the queue
    pub is_complete: bool,
    /// Chapter downloads to append to the queue
    pub new_chapter_tasks: Vec<Task>,
}

/// Why a chapter download may not start yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockReason {
    /// Already running
    AlreadyActive,
    /// Its plugin is paused
    PluginPaused(String),
    /// Its novel is paused
    NovelPaused(NovelId),
    /// Global ceiling reached
    GlobalLimit {
        /// Downloads in flight
        active: usize,
        /// Ceiling
        limit: usize,
    },
    /// Plugin ceiling reached
    PluginLimit {
        /// Plugin id
        plugin_id: String,
        /// Downloads in flight on this plugin
        running: usize,
        /// Ceiling
        limit: usize,
    },
    /// Plugin spacing not yet elapsed
    Throttled {
        /// Plugin id
        plugin_id: String,
        /// Time until the plugin accepts a new start
        remaining: Duration,
    },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::AlreadyActive => write!(f, "already downloading"),
            BlockReason::PluginPaused(plugin) => write!(f, "plugin {plugin} is paused"),
            BlockReason::NovelPaused(novel) => write!(f, "novel {novel} is paused"),
            BlockReason::GlobalLimit { active, limit } => {
                write!(f, "global concurrency limit reached ({active}/{limit})")
            }
            BlockReason::PluginLimit {
                plugin_id,
                running,
                limit,
            } => write!(
                f,
                "plugin {plugin_id} concurrency limit reached ({running}/{limit})"
            ),
            BlockReason::Throttled {
                plugin_id,
                remaining,
            } => write!(
                f,
                "plugin {plugin_id} throttled for another {} ms",
                remaining.as_millis()
            ),
        }
    }
}

/// Answer of [`DownloadCoordinator::can_start`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartDecision {
    /// May start now
    Start,
    /// Must wait
    Wait(BlockReason),
}

impl StartDecision {
    /// True for [`StartDecision::Start`]
    pub fn can_start(&self) -> bool {
        matches!(self, StartDecision::Start)
    }

    /// The blocking reason, if any
    pub fn reason(&self) -> Option<&BlockReason> {
        match self {
            StartDecision::Start => None,
            StartDecision::Wait(reason) => Some(reason),
        }
    }
}

/// How a chapter download ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Content fetched and saved
    Completed,
    /// Already downloaded, nothing fetched
    Skipped,
    /// Error or cancellation
    Failed,
}

/// Snapshot of the coordinator's counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Downloads in flight
    pub active: usize,
    /// Downloads in flight per plugin
    pub running_per_plugin: HashMap<String, usize>,
    /// Finished with content saved
    pub completed: usize,
    /// Finished as already downloaded
    pub skipped: usize,
    /// Finished with an error
    pub failed: usize,
}

#[derive(Default)]
struct CoordinatorState {
    active: HashSet<TaskId>,
    running_per_plugin: HashMap<String, usize>,
    next_allowed: HashMap<String, Instant>,
    completed: usize,
    skipped: usize,
    failed: usize,
}

/// Concurrency and throttling policy for chapter downloads
pub struct DownloadCoordinator {
    config: DownloadConfig,
    library: Arc<dyn Library>,
    state: Mutex<CoordinatorState>,
}

impl DownloadCoordinator {
    /// Create a coordinator with empty counters
    pub fn new(config: DownloadConfig, library: Arc<dyn Library>) -> Self {
        Self {
            config,
            library,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// The policy in force
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Top up chapter downloads for one novel download
    ///
    /// On the first call the chapter selection is computed from `data.mode`.
    /// Chapters already represented by a queued chapter download are never
    /// queued twice, and candidates are re-checked against the library so that
    /// chapters downloaded by another path are counted as done instead.
    pub async fn expand_novel_task(
        &self,
        data: &DownloadNovelData,
        queue: &[QueuedTask],
    ) -> Result<Expansion> {
        let mut updated = data.clone();
        let mut live: Option<Vec<ChapterRecord>> = None;

        if updated.pending_chapter_ids.is_none() {
            let chapters = self.library.chapters(data.novel_id).await?;
            let selected = select_chapters(&chapters, &data.mode);
            tracing::debug!(
                novel_id = data.novel_id,
                selected = selected.len(),
                "Computed chapter selection"
            );
            updated.total_count = selected.len();
            updated.completed_count = 0;
            updated.pending_chapter_ids = Some(selected);
            live = Some(chapters);
        }

        let queued_for_novel: HashSet<ChapterId> = queue
            .iter()
            .filter_map(|t| t.task.as_chapter())
            .filter(|c| c.novel_id == data.novel_id)
            .map(|c| c.chapter_id)
            .collect();

        let actually_pending: Vec<ChapterId> = updated
            .pending_chapter_ids
            .iter()
            .flatten()
            .copied()
            .filter(|id| !queued_for_novel.contains(id))
            .collect();

        let queued_for_plugin = queue
            .iter()
            .filter_map(|t| t.task.as_chapter())
            .filter(|c| c.plugin_id == data.plugin_id)
            .count();
        let target = (2 * self.config.plugin_limit(&data.plugin_id)).min(self.config.global_limit());
        let slots = target.saturating_sub(queued_for_plugin);

        let mut new_chapter_tasks = Vec::new();
        if slots > 0 && !actually_pending.is_empty() {
            let chapters = match live {
                Some(chapters) => chapters,
                None => self.library.chapters(data.novel_id).await?,
            };
            let by_id: HashMap<ChapterId, &ChapterRecord> =
                chapters.iter().map(|c| (c.id, c)).collect();

            for chapter_id in &actually_pending {
                if new_chapter_tasks.len() >= slots {
                    break;
                }
                match by_id.get(chapter_id) {
                    Some(chapter) if chapter.is_downloaded => {
                        tracing::debug!(
                            novel_id = data.novel_id,
                            chapter_id,
                            "Chapter already downloaded elsewhere"
                        );
                        updated.record_chapter_outcome(*chapter_id, true);
                    }
                    Some(chapter) => {
                        new_chapter_tasks.push(Task::DownloadChapter(DownloadChapterData {
                            chapter_id: *chapter_id,
                            novel_id: data.novel_id,
                            plugin_id: data.plugin_id.clone(),
                            novel_name: data.novel_name.clone(),
                            chapter_name: chapter.name.clone(),
                        }));
                    }
                    None => {
                        tracing::warn!(
                            novel_id = data.novel_id,
                            chapter_id,
                            "Pending chapter no longer in library"
                        );
                        updated.record_chapter_outcome(*chapter_id, false);
                    }
                }
            }
        }

        let still_pending = updated
            .pending_chapter_ids
            .iter()
            .flatten()
            .any(|id| !queued_for_novel.contains(id));
        let is_complete =
            !still_pending && queued_for_novel.is_empty() && new_chapter_tasks.is_empty();

        Ok(Expansion {
            updated,
            is_complete,
            new_chapter_tasks,
        })
    }

    /// Decide whether a queued chapter download may start now
    pub fn can_start(
        &self,
        id: &TaskId,
        chapter: &DownloadChapterData,
        paused_plugins: &HashSet<String>,
        paused_novels: &HashSet<NovelId>,
    ) -> StartDecision {
        let state = self.state.lock();

        if state.active.contains(id) {
            return StartDecision::Wait(BlockReason::AlreadyActive);
        }
        if paused_plugins.contains(&chapter.plugin_id) {
            return StartDecision::Wait(BlockReason::PluginPaused(chapter.plugin_id.clone()));
        }
        if paused_novels.contains(&chapter.novel_id) {
            return StartDecision::Wait(BlockReason::NovelPaused(chapter.novel_id));
        }

        let limit = self.config.global_limit();
        if state.active.len() >= limit {
            return StartDecision::Wait(BlockReason::GlobalLimit {
                active: state.active.len(),
                limit,
            });
        }

        let plugin_limit = self.config.plugin_limit(&chapter.plugin_id);
        let running = state
            .running_per_plugin
            .get(&chapter.plugin_id)
            .copied()
            .unwrap_or(0);
        if running >= plugin_limit {
            return StartDecision::Wait(BlockReason::PluginLimit {
                plugin_id: chapter.plugin_id.clone(),
                running,
                limit: plugin_limit,
            });
        }

        if let Some(next) = state.next_allowed.get(&chapter.plugin_id) {
            let now = Instant::now();
            if *next > now {
                return StartDecision::Wait(BlockReason::Throttled {
                    plugin_id: chapter.plugin_id.clone(),
                    remaining: *next - now,
                });
            }
        }

        StartDecision::Start
    }

    /// Record a chapter download as started and push back the plugin's next start
    pub fn start_download(&self, id: TaskId, plugin_id: &str) {
        let spacing = self.config.base_delay + self.jitter();
        let mut state = self.state.lock();
        if !state.active.insert(id) {
            return;
        }
        *state
            .running_per_plugin
            .entry(plugin_id.to_string())
            .or_insert(0) += 1;
        state
            .next_allowed
            .insert(plugin_id.to_string(), Instant::now() + spacing);
    }

    fn jitter(&self) -> Duration {
        let min = self.config.min_jitter.as_millis() as u64;
        let max = (self.config.max_jitter.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Record a chapter download as finished
    ///
    /// Unknown ids (already finished, or dropped by reconciliation) are ignored.
    pub fn finish_download(&self, id: &TaskId, plugin_id: &str, outcome: DownloadOutcome) {
        let mut state = self.state.lock();
        if !state.active.remove(id) {
            return;
        }
        if let Some(running) = state.running_per_plugin.get_mut(plugin_id) {
            *running = running.saturating_sub(1);
            if *running == 0 {
                state.running_per_plugin.remove(plugin_id);
            }
        }
        match outcome {
            DownloadOutcome::Completed => state.completed += 1,
            DownloadOutcome::Skipped => state.skipped += 1,
            DownloadOutcome::Failed => state.failed += 1,
        }
    }

    /// Rebuild in-memory counters from the tasks actually in the queue
    ///
    /// Active ids whose task has vanished are dropped; returns how many.
    pub fn reconcile_state(&self, queue: &[QueuedTask]) -> usize {
        let chapters: HashMap<&TaskId, &DownloadChapterData> = queue
            .iter()
            .filter_map(|t| t.task.as_chapter().map(|c| (&t.id, c)))
            .collect();

        let mut state = self.state.lock();
        let before = state.active.len();
        state.active.retain(|id| chapters.contains_key(id));
        let dropped = before - state.active.len();

        let mut running: HashMap<String, usize> = HashMap::new();
        for id in &state.active {
            if let Some(chapter) = chapters.get(id) {
                *running.entry(chapter.plugin_id.clone()).or_insert(0) += 1;
            }
        }
        state.running_per_plugin = running;

        if dropped > 0 {
            tracing::debug!(dropped, "Reconciled vanished downloads");
        }
        dropped
    }

    /// Downloads in flight
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Whether a download is in flight
    pub fn is_active(&self, id: &TaskId) -> bool {
        self.state.lock().active.contains(id)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> DownloadStats {
        let state = self.state.lock();
        DownloadStats {
            active: state.active.len(),
            running_per_plugin: state.running_per_plugin.clone(),
            completed: state.completed,
            skipped: state.skipped,
            failed: state.failed,
        }
    }

    /// Zero the completion counters at the start of a run
    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.completed = 0;
        state.skipped = 0;
        state.failed = 0;
    }
}

fn select_chapters(chapters: &[ChapterRecord], mode: &DownloadMode) -> Vec<ChapterId> {
    chapters
        .iter()
        .filter(|c| !c.is_downloaded)
        .filter(|c| match mode {
            DownloadMode::All => true,
            DownloadMode::Unread => c.unread,
            DownloadMode::Chapters(ids) => ids.contains(&c.id),
        })
        .map(|c| c.id)
        .collect()
}
