
use crate::test_helpers::{MemoryLibrary, ScriptedPlugin, TestServices};
use crate::types::{ChapterId, DownloadChapterData, NovelId};
use std::sync::Arc;

/// Library with one novel of `chapters` chapters served by plugin "x"
fn library_with_novel(chapters: usize) -> (Arc<MemoryLibrary>, NovelId, Vec<ChapterId>) {
    let library = Arc::new(MemoryLibrary::new());
    let (novel_id, chapter_ids) = library.add_test_novel("x", "Novel", chapters);
    (library, novel_id, chapter_ids)
}

fn chapter_data(novel_id: NovelId, chapter_id: ChapterId) -> DownloadChapterData {
    DownloadChapterData {
        chapter_id,
        novel_id,
        plugin_id: "x".into(),
        novel_name: "Novel".into(),
        chapter_name: format!("Chapter {chapter_id}"),
    }
}

fn services_for(library: Arc<MemoryLibrary>, plugins: Vec<ScriptedPlugin>) -> TestServices {
    TestServices::new(library, plugins)
}
