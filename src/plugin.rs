//! Source plugins
//!
//! A plugin scrapes one novel source. The scheduler treats it as unreliable
//! I/O: every call may fail, and executors wrap calls in
//! [`with_retry`](crate::retry::with_retry).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A novel as listed by a source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NovelItem {
    /// Display name
    pub name: String,
    /// Plugin-relative path
    pub path: String,
    /// Cover image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
}

/// A chapter as listed by a source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChapter {
    /// Display name
    pub name: String,
    /// Plugin-relative path
    pub path: String,
}

/// A novel's details as parsed from a source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceNovel {
    /// Plugin-relative path
    pub path: String,
    /// Display name
    pub name: String,
    /// Chapters in reading order
    pub chapters: Vec<SourceChapter>,
}

/// Options for [`Plugin::popular_novels`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PopularOptions {
    /// List by latest update instead of popularity
    #[serde(default)]
    pub show_latest_novels: bool,
    /// Source-specific filter values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

/// Scraper capability for one novel source
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Stable plugin id
    fn id(&self) -> &str;

    /// Browse the source
    async fn popular_novels(&self, page: u32, options: &PopularOptions) -> Result<Vec<NovelItem>>;

    /// Search the source
    async fn search_novels(&self, text: &str, page: u32) -> Result<Vec<NovelItem>>;

    /// Fetch a novel's details and chapter list
    async fn parse_novel(&self, path: &str) -> Result<SourceNovel>;

    /// Fetch one chapter's content
    async fn parse_chapter(&self, path: &str) -> Result<String>;
}

/// Installed plugins by id
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a plugin, replacing any previous one with the same id
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    /// Look up a plugin
    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(id).cloned()
    }

    /// Look up a plugin, failing with [`Error::PluginNotFound`]
    pub fn require(&self, id: &str) -> Result<Arc<dyn Plugin>> {
        self.get(id)
            .ok_or_else(|| Error::PluginNotFound(id.to_string()))
    }

    /// Installed plugin ids
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.keys().cloned().collect();
        ids.sort();
        ids
    }
}
