mod run_loop;

use crate::db::{MemoryStore, QUEUE_KEY};
use crate::test_helpers::{MemoryLibrary, ScriptedPlugin, TestServices};
use crate::types::{
    ChapterId, DownloadChapterData, DownloadMode, DownloadNovelData, NovelId, QueuedTask, Task,
    TaskId,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll `condition` every 10ms, failing the test after 5 seconds
pub(super) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Persist a queue before the scheduler is created, so nothing runs until asked
pub(super) fn seed_queue(kv: &MemoryStore, tasks: Vec<Task>) -> Vec<TaskId> {
    let queued: Vec<QueuedTask> = tasks.into_iter().map(QueuedTask::new).collect();
    let ids = queued.iter().map(|t| t.id.clone()).collect();
    kv.insert(QUEUE_KEY, serde_json::to_value(&queued).unwrap());
    ids
}

pub(super) fn chapter(
    novel_id: NovelId,
    chapter_id: ChapterId,
    plugin_id: &str,
) -> DownloadChapterData {
    DownloadChapterData {
        chapter_id,
        novel_id,
        plugin_id: plugin_id.to_string(),
        novel_name: format!("Novel {novel_id}"),
        chapter_name: format!("Chapter {chapter_id}"),
    }
}

pub(super) fn novel_download(novel_id: NovelId, plugin_id: &str) -> DownloadNovelData {
    DownloadNovelData::new(novel_id, plugin_id, format!("Novel {novel_id}"), DownloadMode::All)
}

/// A library holding one novel of `chapters` chapters served by plugin "x"
pub(super) fn one_novel_services(
    chapters: usize,
    plugin: ScriptedPlugin,
) -> (TestServices, NovelId, Vec<ChapterId>) {
    let library = Arc::new(MemoryLibrary::new());
    let (novel_id, chapter_ids) = library.add_test_novel("x", "Novel", chapters);
    (TestServices::new(library, vec![plugin]), novel_id, chapter_ids)
}

/// Chapter download tasks for every chapter of one novel
pub(super) fn chapter_tasks(novel_id: NovelId, chapter_ids: &[ChapterId]) -> Vec<Task> {
    chapter_ids
        .iter()
        .map(|id| Task::DownloadChapter(chapter(novel_id, *id, "x")))
        .collect()
}
