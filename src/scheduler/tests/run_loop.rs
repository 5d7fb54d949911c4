use super::*;
use crate::scheduler::run_loop::Iteration;
use crate::test_helpers::{create_test_scheduler, fast_config};
use crate::types::{
    BackupData, Event, ImportSource, MassImportData, MassImportItem, MigrateNovelData,
    SchedulerState, TaskKind, UpdateLibraryData,
};
use parking_lot::Mutex;
use std::collections::HashSet;

#[tokio::test]
async fn test_foreground_task_runs_before_queued_download() {
    let kv = Arc::new(MemoryStore::new());
    let ids = seed_queue(
        &kv,
        vec![
            Task::DownloadChapter(chapter(10, 1, "x")),
            Task::UpdateLibrary(UpdateLibraryData::default()),
        ],
    );
    let (services, _, _) = one_novel_services(0, ScriptedPlugin::new("x"));
    let t = create_test_scheduler(fast_config(), services, kv).await;

    let step = t.scheduler.run_iteration().await;
    assert_eq!(step, Iteration::ExecutedTask(ids[1].clone()));

    let queue = t.scheduler.queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, ids[0]);
    assert!(!queue[0].meta.is_running, "chapter task must be untouched");
    assert_eq!(t.scheduler.coordinator.active_count(), 0);
}

#[tokio::test]
async fn test_priority_iteration_starts_no_download() {
    let kv = Arc::new(MemoryStore::new());
    let (services, novel_id, chapter_ids) = one_novel_services(3, ScriptedPlugin::new("x"));
    let dir = tempfile::tempdir().unwrap();
    let mut tasks = chapter_tasks(novel_id, &chapter_ids);
    tasks.push(Task::Backup(BackupData {
        target_dir: dir.path().to_path_buf(),
    }));
    seed_queue(&kv, tasks);
    let t = create_test_scheduler(fast_config(), services, kv).await;

    let step = t.scheduler.run_iteration().await;
    assert!(matches!(step, Iteration::ExecutedTask(_)));
    assert_eq!(t.scheduler.coordinator.active_count(), 0);
    assert_eq!(t.scheduler.in_flight(), 0);
    assert_eq!(t.services.library.saves(), 0);
    assert_eq!(t.scheduler.queue().len(), 3);

    // Next iteration turns to the downloads
    let step = t.scheduler.run_iteration().await;
    assert!(matches!(step, Iteration::StartedDownload(_)));
}

#[tokio::test]
async fn test_global_ceiling_holds_third_download() {
    let mut config = fast_config();
    config.download.max_global_concurrency = 2;
    config.download.max_concurrent_per_plugin = 5;

    let kv = Arc::new(MemoryStore::new());
    let plugin = ScriptedPlugin::new("x").with_delay(Duration::from_millis(200));
    let (services, novel_id, chapter_ids) = one_novel_services(3, plugin);
    let ids = seed_queue(&kv, chapter_tasks(novel_id, &chapter_ids));
    let t = create_test_scheduler(config, services, kv).await;

    assert_eq!(
        t.scheduler.run_iteration().await,
        Iteration::StartedDownload(ids[0].clone())
    );
    assert_eq!(
        t.scheduler.run_iteration().await,
        Iteration::StartedDownload(ids[1].clone())
    );
    assert_eq!(t.scheduler.run_iteration().await, Iteration::Waiting);

    let third = chapter(novel_id, chapter_ids[2], "x");
    let decision = t.scheduler.coordinator.can_start(
        &ids[2],
        &third,
        &HashSet::new(),
        &HashSet::new(),
    );
    assert!(!decision.can_start());
    assert!(
        decision.reason().unwrap().to_string().contains("concurrency limit"),
        "unexpected reason: {:?}",
        decision.reason()
    );

    let scheduler = t.scheduler.clone();
    wait_until("a download to finish", || scheduler.in_flight() < 2).await;
    assert_eq!(
        t.scheduler.run_iteration().await,
        Iteration::StartedDownload(ids[2].clone())
    );
}

#[tokio::test]
async fn test_plugin_ceiling_holds_across_a_full_run() {
    let mut config = fast_config();
    config.download.max_global_concurrency = 4;
    config.download.max_concurrent_per_plugin = 1;

    let kv = Arc::new(MemoryStore::new());
    let plugin = ScriptedPlugin::new("x").with_delay(Duration::from_millis(30));
    let (services, novel_id, chapter_ids) = one_novel_services(4, plugin);
    seed_queue(&kv, chapter_tasks(novel_id, &chapter_ids));
    let t = create_test_scheduler(config, services, kv).await;

    t.scheduler.start();
    let scheduler = t.scheduler.clone();
    wait_until("all downloads", || scheduler.queue().is_empty()).await;

    assert_eq!(t.services.library.saves(), 4);
    assert_eq!(t.services.plugins[0].chapter_calls(), 4);
    assert_eq!(t.services.plugins[0].max_in_flight(), 1);
}

#[tokio::test]
async fn test_blocked_head_does_not_stall_other_plugins() {
    let kv = Arc::new(MemoryStore::new());
    let library = Arc::new(MemoryLibrary::new());
    let (slow_novel, slow_chapters) = library.add_test_novel("slow", "Slow", 2);
    let (fast_novel, fast_chapters) = library.add_test_novel("fast", "Fast", 1);
    let ids = seed_queue(
        &kv,
        vec![
            Task::DownloadChapter(chapter(slow_novel, slow_chapters[0], "slow")),
            Task::DownloadChapter(chapter(slow_novel, slow_chapters[1], "slow")),
            Task::DownloadChapter(chapter(fast_novel, fast_chapters[0], "fast")),
        ],
    );
    let services = TestServices::new(
        library,
        vec![
            ScriptedPlugin::new("slow").with_delay(Duration::from_millis(200)),
            ScriptedPlugin::new("fast"),
        ],
    );
    let t = create_test_scheduler(fast_config(), services, kv).await;

    assert_eq!(
        t.scheduler.run_iteration().await,
        Iteration::StartedDownload(ids[0].clone())
    );
    // Second "slow" chapter is blocked by the per-plugin ceiling of 1
    assert_eq!(
        t.scheduler.run_iteration().await,
        Iteration::StartedDownload(ids[2].clone())
    );
}

#[tokio::test]
async fn test_novel_download_runs_to_completion() {
    let kv = Arc::new(MemoryStore::new());
    let (services, novel_id, chapter_ids) = one_novel_services(4, ScriptedPlugin::new("x"));
    let t = create_test_scheduler(fast_config(), services, kv).await;
    let mut events = t.scheduler.subscribe();

    let novel_task = t
        .scheduler
        .add_task(Task::DownloadNovel(novel_download(novel_id, "x")))
        .await
        .unwrap()
        .unwrap();

    let scheduler = t.scheduler.clone();
    wait_until("the run to finish", || {
        scheduler.state() == SchedulerState::Idle && scheduler.queue().is_empty()
    })
    .await;

    for id in &chapter_ids {
        assert!(t.services.library.is_downloaded(*id));
    }

    let mut novel_result = None;
    let mut summary = None;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::TaskCompleted { id, result, .. } if id == novel_task => novel_result = result,
            Event::RunFinished { summary: s } => summary = Some(s),
            _ => {}
        }
    }
    let result = novel_result.expect("novel completion event");
    assert_eq!(result["completed"], 4);
    assert_eq!(result["total"], 4);

    let summary = summary.expect("run finished event");
    assert_eq!(summary.completed.get(&TaskKind::DownloadChapter), Some(&4));
    assert_eq!(summary.completed.get(&TaskKind::DownloadNovel), Some(&1));
    assert!(t.sink.titles().contains(&"Background tasks finished".to_string()));
}

#[tokio::test]
async fn test_expansion_is_bounded_per_iteration() {
    let mut config = fast_config();
    config.download.max_global_concurrency = 3;
    config.download.max_concurrent_per_plugin = 1;

    let kv = Arc::new(MemoryStore::new());
    let (services, novel_id, _) = one_novel_services(10, ScriptedPlugin::new("x"));
    seed_queue(&kv, vec![Task::DownloadNovel(novel_download(novel_id, "x"))]);
    let t = create_test_scheduler(config, services, kv).await;
    t.scheduler.pause_plugin("x").await.unwrap();

    t.scheduler.run_iteration().await;
    t.scheduler.run_iteration().await;

    let queue = t.scheduler.queue();
    let chapters = queue.iter().filter(|t| t.kind() == TaskKind::DownloadChapter).count();
    assert_eq!(chapters, 2, "target is min(2 x plugin limit, global limit)");

    let novel = queue
        .iter()
        .find_map(|t| t.task.as_novel())
        .unwrap();
    assert_eq!(novel.total_count, 10);
    assert_eq!(novel.pending_chapter_ids.as_ref().unwrap().len(), 10);
}

#[tokio::test]
async fn test_failed_task_is_removed_and_reported() {
    let (services, novel_id, _) = one_novel_services(1, ScriptedPlugin::new("x"));
    let t = create_test_scheduler(fast_config(), services, Arc::new(MemoryStore::new())).await;
    let mut events = t.scheduler.subscribe();

    let id = t
        .scheduler
        .add_task(Task::MigrateNovel(MigrateNovelData {
            from_novel_id: novel_id,
            to_plugin_id: "missing".into(),
            to_path: "elsewhere".into(),
            novel_name: "Novel".into(),
        }))
        .await
        .unwrap()
        .unwrap();

    let scheduler = t.scheduler.clone();
    wait_until("the run to finish", || scheduler.state() == SchedulerState::Idle).await;

    assert!(t.scheduler.queue().is_empty());
    assert!(t.sink.titles().contains(&"Migrate Novel failed".to_string()));

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if let Event::TaskFailed { id: failed_id, error, .. } = event {
            assert_eq!(failed_id, id);
            assert!(error.contains("missing"));
            failed = true;
        }
    }
    assert!(failed);
}

#[tokio::test]
async fn test_result_is_visible_before_removal() {
    let library = Arc::new(MemoryLibrary::new());
    let plugin = ScriptedPlugin::new("x").with_novel("a", "Alpha", &["one"]);
    let services = TestServices::new(library, vec![plugin]);
    let t = create_test_scheduler(fast_config(), services, Arc::new(MemoryStore::new())).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = t.scheduler.observe(TaskKind::MassImport, move |task| {
        if let Some(task) = task {
            sink.lock().push(task.meta.clone());
        }
    });

    t.scheduler
        .add_task(Task::MassImport(MassImportData {
            items: vec![MassImportItem {
                plugin_id: "x".into(),
                source: ImportSource::Path("a".into()),
            }],
        }))
        .await
        .unwrap();

    let scheduler = t.scheduler.clone();
    wait_until("the import to finish", || scheduler.queue().is_empty()).await;

    let finished = seen
        .lock()
        .iter()
        .find(|meta| meta.result.is_some())
        .cloned()
        .expect("a flush carrying the result");
    assert_eq!(finished.progress, Some(1.0));
    assert_eq!(finished.result.unwrap()["added"], 1);
}

#[tokio::test]
async fn test_library_update_queues_new_chapters() {
    let mut config = fast_config();
    config.download.download_new_chapters = true;

    let library = Arc::new(MemoryLibrary::new());
    library.add_test_novel("x", "Novel", 0);
    let plugin = ScriptedPlugin::new("x").with_novel("novel-1", "Novel", &["c1", "c2"]);
    let services = TestServices::new(library, vec![plugin]);
    let t = create_test_scheduler(config, services, Arc::new(MemoryStore::new())).await;

    t.scheduler
        .add_task(Task::UpdateLibrary(UpdateLibraryData::default()))
        .await
        .unwrap();

    let library = t.services.library.clone();
    wait_until("new chapters to download", || library.saves() == 2).await;
    let scheduler = t.scheduler.clone();
    wait_until("the queue to drain", || scheduler.queue().is_empty()).await;
}

#[tokio::test]
async fn test_empty_queue_finishes() {
    let (services, _, _) = one_novel_services(0, ScriptedPlugin::new("x"));
    let t = create_test_scheduler(fast_config(), services, Arc::new(MemoryStore::new())).await;
    assert_eq!(t.scheduler.run_iteration().await, Iteration::Finished);

    t.scheduler.set_reading_session(true);
    assert_eq!(t.scheduler.run_iteration().await, Iteration::Waiting);
}

#[tokio::test]
async fn test_reading_session_keeps_run_alive() {
    let (services, _, _) = one_novel_services(0, ScriptedPlugin::new("x"));
    let t = create_test_scheduler(fast_config(), services, Arc::new(MemoryStore::new())).await;
    t.scheduler.set_reading_session(true);

    t.scheduler
        .add_task(Task::UpdateLibrary(UpdateLibraryData::default()))
        .await
        .unwrap();

    let scheduler = t.scheduler.clone();
    wait_until("the update to finish", || scheduler.queue().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.scheduler.state(), SchedulerState::Running);

    t.scheduler.set_reading_session(false);
    wait_until("the run to end", || scheduler.state() == SchedulerState::Idle).await;
    assert!(
        t.sink
            .titles()
            .contains(&"Background tasks finished".to_string())
    );
}
