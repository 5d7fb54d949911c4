//! The library store, as seen by executors
//!
//! Novels and chapters live in an external relational store; executors only
//! need the CRUD surface below.

use crate::error::Result;
use crate::plugin::SourceNovel;
use crate::types::{ChapterId, NovelId};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A novel in the library
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NovelRecord {
    /// Library id
    pub id: NovelId,
    /// Source plugin
    pub plugin_id: String,
    /// Plugin-relative path
    pub path: String,
    /// Display name
    pub name: String,
}

/// A chapter in the library
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRecord {
    /// Library id
    pub id: ChapterId,
    /// Owning novel
    pub novel_id: NovelId,
    /// Display name
    pub name: String,
    /// Plugin-relative path
    pub path: String,
    /// Content is stored locally
    pub is_downloaded: bool,
    /// Not yet read
    pub unread: bool,
}

/// Result of [`Library::add_novel`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddedNovel {
    /// Newly inserted
    Added(NovelId),
    /// Already in the library
    Existing(NovelId),
}

impl AddedNovel {
    /// The novel's id either way
    pub fn id(self) -> NovelId {
        match self {
            AddedNovel::Added(id) | AddedNovel::Existing(id) => id,
        }
    }
}

/// CRUD collaborator over the library database
#[async_trait::async_trait]
pub trait Library: Send + Sync {
    /// Fetch a novel; `Error::NovelNotFound` when absent
    async fn novel(&self, id: NovelId) -> Result<NovelRecord>;

    /// Novels in the library, optionally restricted to one category
    async fn library_novels(&self, category_id: Option<i64>) -> Result<Vec<NovelRecord>>;

    /// A novel's chapters in reading order
    async fn chapters(&self, novel_id: NovelId) -> Result<Vec<ChapterRecord>>;

    /// Fetch a chapter; `Error::ChapterNotFound` when absent
    async fn chapter(&self, id: ChapterId) -> Result<ChapterRecord>;

    /// Store chapter content and mark it downloaded
    async fn save_chapter(&self, id: ChapterId, content: &str) -> Result<()>;

    /// Stored content of a downloaded chapter
    async fn chapter_content(&self, id: ChapterId) -> Result<String>;

    /// Insert a parsed novel and its chapters
    async fn add_novel(&self, plugin_id: &str, novel: &SourceNovel) -> Result<AddedNovel>;

    /// Merge a fresh parse into an existing novel; returns the chapters that were new
    async fn refresh_novel(&self, id: NovelId, novel: &SourceNovel) -> Result<Vec<ChapterRecord>>;

    /// Carry reading progress from one novel to another
    async fn migrate_progress(&self, from: NovelId, to: NovelId) -> Result<()>;

    /// Serialize the library
    async fn export_backup(&self) -> Result<serde_json::Value>;

    /// Import a serialized library; returns the number of novels restored
    async fn import_backup(&self, backup: &serde_json::Value) -> Result<usize>;

    /// Import a local EPUB as a novel
    async fn import_epub(&self, path: &Path) -> Result<NovelId>;
}
