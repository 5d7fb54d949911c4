//! Core types for novel-tasks

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Library-side novel identifier
pub type NovelId = i64;

/// Library-side chapter identifier
pub type ChapterId = i64;

/// Unique identifier for a queued task
///
/// Generated once at enqueue time and never reused.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a fresh, random task id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tag of a [`Task`] variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Refresh every novel in the library from its source
    UpdateLibrary,
    /// Download a single chapter
    DownloadChapter,
    /// Download many chapters of one novel (expanded into chapter downloads)
    DownloadNovel,
    /// Export the library to a backup file
    Backup,
    /// Import a backup file into the library
    Restore,
    /// Add many novels to the library at once
    MassImport,
    /// Synchronise reading progress with trackers
    TrackerSync,
    /// Read a chapter aloud
    Tts,
    /// Move a novel to another source
    MigrateNovel,
    /// Import a local EPUB file
    ImportEpub,
}

impl TaskKind {
    /// All kinds, in declaration order
    pub const ALL: [TaskKind; 10] = [
        TaskKind::UpdateLibrary,
        TaskKind::DownloadChapter,
        TaskKind::DownloadNovel,
        TaskKind::Backup,
        TaskKind::Restore,
        TaskKind::MassImport,
        TaskKind::TrackerSync,
        TaskKind::Tts,
        TaskKind::MigrateNovel,
        TaskKind::ImportEpub,
    ];

    /// Whether several instances of this kind may be queued at once
    pub fn is_multiplicable(self) -> bool {
        matches!(
            self,
            TaskKind::DownloadChapter
                | TaskKind::DownloadNovel
                | TaskKind::ImportEpub
                | TaskKind::MigrateNovel
                | TaskKind::MassImport
        )
    }

    /// Download-class kinds never take the foreground slot
    pub fn is_download(self) -> bool {
        matches!(self, TaskKind::DownloadChapter | TaskKind::DownloadNovel)
    }

    /// Stable wire name
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::UpdateLibrary => "UPDATE_LIBRARY",
            TaskKind::DownloadChapter => "DOWNLOAD_CHAPTER",
            TaskKind::DownloadNovel => "DOWNLOAD_NOVEL",
            TaskKind::Backup => "BACKUP",
            TaskKind::Restore => "RESTORE",
            TaskKind::MassImport => "MASS_IMPORT",
            TaskKind::TrackerSync => "TRACKER_SYNC",
            TaskKind::Tts => "TTS",
            TaskKind::MigrateNovel => "MIGRATE_NOVEL",
            TaskKind::ImportEpub => "IMPORT_EPUB",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload for [`Task::UpdateLibrary`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateLibraryData {
    /// Restrict the update to one library category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<i64>,
}

/// Payload for [`Task::DownloadChapter`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChapterData {
    /// Chapter to download
    pub chapter_id: ChapterId,
    /// Novel the chapter belongs to
    pub novel_id: NovelId,
    /// Source plugin serving the chapter
    pub plugin_id: String,
    /// Display name of the novel
    pub novel_name: String,
    /// Display name of the chapter
    pub chapter_name: String,
}

/// Which chapters a novel download covers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "ids")]
pub enum DownloadMode {
    /// Every chapter not yet downloaded
    All,
    /// Unread chapters not yet downloaded
    Unread,
    /// An explicit chapter list (intersected with not-yet-downloaded)
    Chapters(Vec<ChapterId>),
}

/// Payload for [`Task::DownloadNovel`]
///
/// `novel_id`, `plugin_id`, `novel_name` and `mode` are fixed at enqueue time.
/// The remaining fields are runtime state, mutated in place by the scheduler as
/// chapters complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadNovelData {
    /// Novel to download
    pub novel_id: NovelId,
    /// Source plugin of the novel
    pub plugin_id: String,
    /// Display name of the novel
    #[serde(default)]
    pub novel_name: String,
    /// Chapter selection
    pub mode: DownloadMode,
    /// Chapters still to download; `None` until the first expansion
    #[serde(default)]
    pub pending_chapter_ids: Option<Vec<ChapterId>>,
    /// Chapters downloaded (or found already downloaded)
    #[serde(default)]
    pub completed_count: usize,
    /// Size of the chapter selection
    #[serde(default)]
    pub total_count: usize,
    /// Chapters whose download failed
    #[serde(default)]
    pub failed_chapter_ids: Vec<ChapterId>,
}

impl DownloadNovelData {
    /// A fresh novel download with no runtime state yet
    pub fn new(
        novel_id: NovelId,
        plugin_id: impl Into<String>,
        novel_name: impl Into<String>,
        mode: DownloadMode,
    ) -> Self {
        Self {
            novel_id,
            plugin_id: plugin_id.into(),
            novel_name: novel_name.into(),
            mode,
            pending_chapter_ids: None,
            completed_count: 0,
            total_count: 0,
            failed_chapter_ids: Vec::new(),
        }
    }

    /// Fold one finished chapter download into the runtime state.
    ///
    /// Skipped chapters (already present) count as completed.
    pub fn record_chapter_outcome(&mut self, chapter_id: ChapterId, succeeded: bool) {
        let Some(pending) = self.pending_chapter_ids.as_mut() else {
            return;
        };
        let before = pending.len();
        pending.retain(|id| *id != chapter_id);
        if pending.len() == before {
            return;
        }
        if succeeded {
            self.completed_count = (self.completed_count + 1).min(self.total_count);
        } else if !self.failed_chapter_ids.contains(&chapter_id) {
            self.failed_chapter_ids.push(chapter_id);
        }
    }

    /// Drop a chapter from the selection (its download was removed by the user)
    pub fn forget_chapter(&mut self, chapter_id: ChapterId) {
        let Some(pending) = self.pending_chapter_ids.as_mut() else {
            return;
        };
        let before = pending.len();
        pending.retain(|id| *id != chapter_id);
        if pending.len() < before {
            self.total_count = self.total_count.saturating_sub(1);
            self.completed_count = self.completed_count.min(self.total_count);
        }
    }
}

/// Where a backup is written
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupData {
    /// Directory receiving the backup file
    pub target_dir: PathBuf,
}

/// Which backup file to restore
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestoreData {
    /// Backup file produced by a [`Task::Backup`]
    pub source: PathBuf,
}

/// How a mass-import item locates its novel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ImportSource {
    /// Plugin-relative novel path
    Path(String),
    /// Search query; the first hit is imported
    Search(String),
}

/// One novel of a mass import
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MassImportItem {
    /// Source plugin
    pub plugin_id: String,
    /// How to find the novel at that source
    pub source: ImportSource,
}

/// Payload for [`Task::MassImport`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MassImportData {
    /// Novels to import, in order
    pub items: Vec<MassImportItem>,
}

/// Direction of a tracker synchronisation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Pull reading progress from trackers
    #[default]
    FromTrackers,
    /// Push local reading progress to trackers
    ToTrackers,
}

/// Payload for [`Task::TrackerSync`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerSyncData {
    /// Sync direction
    #[serde(default)]
    pub direction: SyncDirection,
}

/// Payload for [`Task::Tts`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsData {
    /// Novel being read
    pub novel_id: NovelId,
    /// Chapter to read aloud
    pub chapter_id: ChapterId,
    /// Display name of the chapter
    #[serde(default)]
    pub chapter_name: String,
}

/// Payload for [`Task::MigrateNovel`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateNovelData {
    /// Novel currently in the library
    pub from_novel_id: NovelId,
    /// Target plugin
    pub to_plugin_id: String,
    /// Novel path at the target plugin
    pub to_path: String,
    /// Display name used in notifications
    #[serde(default)]
    pub novel_name: String,
}

/// Payload for [`Task::ImportEpub`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportEpubData {
    /// EPUB file on disk
    pub path: PathBuf,
}

/// A unit of background work
///
/// Serialized as `{"kind": ..., "data": ...}`. A missing `data` reads as an
/// empty object, so kinds whose payload fields all have defaults load without it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "data",
    rename_all = "SCREAMING_SNAKE_CASE",
    try_from = "RawTask"
)]
pub enum Task {
    /// Refresh the library
    UpdateLibrary(UpdateLibraryData),
    /// Download one chapter
    DownloadChapter(DownloadChapterData),
    /// Download a selection of a novel's chapters
    DownloadNovel(DownloadNovelData),
    /// Write a backup
    Backup(BackupData),
    /// Restore a backup
    Restore(RestoreData),
    /// Import several novels
    MassImport(MassImportData),
    /// Sync with trackers
    TrackerSync(TrackerSyncData),
    /// Read a chapter aloud
    Tts(TtsData),
    /// Migrate a novel to another source
    MigrateNovel(MigrateNovelData),
    /// Import an EPUB
    ImportEpub(ImportEpubData),
}

/// Wire shape of a [`Task`] before its payload is interpreted
#[derive(Deserialize)]
struct RawTask {
    kind: TaskKind,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl TryFrom<RawTask> for Task {
    type Error = serde_json::Error;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        use serde_json::from_value as payload;

        let data = raw
            .data
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        Ok(match raw.kind {
            TaskKind::UpdateLibrary => Task::UpdateLibrary(payload(data)?),
            TaskKind::DownloadChapter => Task::DownloadChapter(payload(data)?),
            TaskKind::DownloadNovel => Task::DownloadNovel(payload(data)?),
            TaskKind::Backup => Task::Backup(payload(data)?),
            TaskKind::Restore => Task::Restore(payload(data)?),
            TaskKind::MassImport => Task::MassImport(payload(data)?),
            TaskKind::TrackerSync => Task::TrackerSync(payload(data)?),
            TaskKind::Tts => Task::Tts(payload(data)?),
            TaskKind::MigrateNovel => Task::MigrateNovel(payload(data)?),
            TaskKind::ImportEpub => Task::ImportEpub(payload(data)?),
        })
    }
}

impl Task {
    /// The variant tag
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::UpdateLibrary(_) => TaskKind::UpdateLibrary,
            Task::DownloadChapter(_) => TaskKind::DownloadChapter,
            Task::DownloadNovel(_) => TaskKind::DownloadNovel,
            Task::Backup(_) => TaskKind::Backup,
            Task::Restore(_) => TaskKind::Restore,
            Task::MassImport(_) => TaskKind::MassImport,
            Task::TrackerSync(_) => TaskKind::TrackerSync,
            Task::Tts(_) => TaskKind::Tts,
            Task::MigrateNovel(_) => TaskKind::MigrateNovel,
            Task::ImportEpub(_) => TaskKind::ImportEpub,
        }
    }

    /// Human-readable name shown in notifications
    pub fn display_name(&self) -> String {
        match self {
            Task::UpdateLibrary(data) => match data.category_id {
                Some(category) => format!("Update library (category {category})"),
                None => "Update library".to_string(),
            },
            Task::DownloadChapter(data) => {
                format!("Download {} - {}", data.novel_name, data.chapter_name)
            }
            Task::DownloadNovel(data) => format!("Download {}", data.novel_name),
            Task::Backup(_) => "Backup".to_string(),
            Task::Restore(_) => "Restore backup".to_string(),
            Task::MassImport(data) => format!("Import {} novels", data.items.len()),
            Task::TrackerSync(data) => match data.direction {
                SyncDirection::FromTrackers => "Sync from trackers".to_string(),
                SyncDirection::ToTrackers => "Sync to trackers".to_string(),
            },
            Task::Tts(data) => format!("Reading {}", data.chapter_name),
            Task::MigrateNovel(data) => format!("Migrate {}", data.novel_name),
            Task::ImportEpub(data) => format!(
                "Import {}",
                data.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "EPUB".to_string())
            ),
        }
    }

    /// Chapter payload if this is a chapter download
    pub fn as_chapter(&self) -> Option<&DownloadChapterData> {
        match self {
            Task::DownloadChapter(data) => Some(data),
            _ => None,
        }
    }

    /// Novel payload if this is a novel download
    pub fn as_novel(&self) -> Option<&DownloadNovelData> {
        match self {
            Task::DownloadNovel(data) => Some(data),
            _ => None,
        }
    }
}

/// Runtime metadata of a queued task
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Whether the task has been dispatched
    #[serde(default)]
    pub is_running: bool,
    /// Progress in `[0, 1]`, `None` while indeterminate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Free-form progress description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_text: Option<String>,
    /// Executor result kept for the UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl TaskMetadata {
    /// Metadata of a task that has not started
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the progress, clamped to `[0, 1]`
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 1.0));
        self
    }

    /// Set the progress description
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.progress_text = Some(text.into());
        self
    }
}

/// A task as held in the queue
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Unique id
    pub id: TaskId,
    /// Runtime metadata; absent in older snapshots
    #[serde(default)]
    pub meta: TaskMetadata,
    /// The work itself
    pub task: Task,
}

impl QueuedTask {
    /// Wrap a task with a fresh id
    pub fn new(task: Task) -> Self {
        Self {
            id: TaskId::generate(),
            meta: TaskMetadata::named(task.display_name()),
            task,
        }
    }

    /// Shorthand for `self.task.kind()`
    pub fn kind(&self) -> TaskKind {
        self.task.kind()
    }
}

/// What an executor produced
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutput {
    /// Work done, with an optional structured result retained for the UI
    Done(Option<serde_json::Value>),
    /// Nothing to do (e.g. chapter already present); counted separately
    Skipped,
}

/// Connectivity reported by the network collaborator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Wi-Fi or another unmetered link
    Wifi,
    /// Metered mobile data
    Cellular,
    /// Wired ethernet
    Ethernet,
    /// Connected, type unknown
    #[default]
    Unknown,
    /// No connectivity
    None,
}

/// Coarse state of the scheduler loop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// No loop running
    Idle,
    /// Loop active and dispatching
    Running,
    /// Loop active but not dispatching
    Paused,
}

/// Aggregate outcome of one scheduler run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Completed tasks per kind (novel downloads count once when retired)
    pub completed: BTreeMap<TaskKind, usize>,
    /// Chapters skipped because they were already downloaded
    pub skipped: usize,
    /// Failed tasks of any kind
    pub failed: usize,
}

impl RunSummary {
    /// True when the run did nothing worth reporting
    pub fn is_empty(&self) -> bool {
        self.completed.values().all(|n| *n == 0) && self.skipped == 0 && self.failed == 0
    }

    /// Count one completion of `kind`
    pub fn record_completed(&mut self, kind: TaskKind) {
        *self.completed.entry(kind).or_insert(0) += 1;
    }

    /// Human-readable one-line description
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .completed
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(kind, n)| match kind {
                TaskKind::DownloadChapter => format!("{n} chapters downloaded"),
                TaskKind::DownloadNovel => format!("{n} novels downloaded"),
                TaskKind::UpdateLibrary => format!("{n} library updates"),
                TaskKind::MassImport => format!("{n} imports"),
                TaskKind::ImportEpub => format!("{n} EPUBs imported"),
                TaskKind::MigrateNovel => format!("{n} novels migrated"),
                other => format!("{n} x {}", other.as_str().to_lowercase()),
            })
            .collect();
        if self.skipped > 0 {
            parts.push(format!("{} already downloaded", self.skipped));
        }
        if self.failed > 0 {
            parts.push(format!("{} failed", self.failed));
        }
        parts.join(", ")
    }
}

/// Event emitted during scheduler operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task accepted into the queue
    TaskQueued {
        /// Task id
        id: TaskId,
        /// Task kind
        kind: TaskKind,
    },
    /// Task dispatched
    TaskStarted {
        /// Task id
        id: TaskId,
        /// Task kind
        kind: TaskKind,
    },
    /// Executor reported progress
    TaskProgress {
        /// Task id
        id: TaskId,
        /// Progress in `[0, 1]` when known
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
        /// Progress text when provided
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Task finished successfully
    TaskCompleted {
        /// Task id
        id: TaskId,
        /// Task kind
        kind: TaskKind,
        /// Result retained by the executor
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// Task had nothing to do
    TaskSkipped {
        /// Task id
        id: TaskId,
        /// Task kind
        kind: TaskKind,
    },
    /// Task failed
    TaskFailed {
        /// Task id
        id: TaskId,
        /// Task kind
        kind: TaskKind,
        /// Error message
        error: String,
    },
    /// Task was cancelled
    TaskCancelled {
        /// Task id
        id: TaskId,
    },
    /// Dispatching paused
    Paused,
    /// Dispatching resumed
    Resumed,
    /// The loop started
    RunStarted,
    /// The loop finished
    RunFinished {
        /// What the run accomplished
        summary: RunSummary,
    },
    /// Downloads are held until an unmetered connection returns
    WaitingForNetwork,
    /// Scheduler shut down
    Shutdown,
}
