//! Persistence layer for novel-tasks
//!
//! The scheduler only needs keyed get/set of JSON blobs (the queue snapshot,
//! the pause lists). [`KeyValueStore`] is that seam; [`Database`] backs it
//! with SQLite and [`MemoryStore`] keeps everything in process.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`kv`] - JSON blob storage
//! - [`state`] - Runtime state (clean shutdown tracking)

use crate::error::Result;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;

mod kv;
mod migrations;
mod state;


/// Key of the persisted queue snapshot
pub const QUEUE_KEY: &str = "task_queue";
/// Key of the paused plugin id list
pub const PAUSED_PLUGINS_KEY: &str = "paused_plugins";
/// Key of the paused novel id list
pub const PAUSED_NOVELS_KEY: &str = "paused_novels";

/// Keyed storage of JSON-serializable blobs
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Write (or overwrite) a value
    async fn set(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    /// Mark the process as running; returns whether the previous run ended uncleanly
    async fn mark_started(&self) -> Result<bool> {
        Ok(false)
    }

    /// Mark the process as cleanly shut down
    async fn mark_stopped(&self) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed store
pub struct Database {
    pool: SqlitePool,
}

#[async_trait::async_trait]
impl KeyValueStore for Database {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.get_value(key).await
    }

    async fn set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.set_value(key, value).await
    }

    async fn mark_started(&self) -> Result<bool> {
        let unclean = self.was_unclean_shutdown().await?;
        self.set_clean_start().await?;
        Ok(unclean)
    }

    async fn mark_stopped(&self) -> Result<()> {
        self.set_clean_shutdown().await
    }
}

/// In-process store, for tests and ephemeral embedding
#[derive(Default)]
pub struct MemoryStore {
    values: parking_lot::Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value synchronously
    pub fn insert(&self, key: impl Into<String>, value: serde_json::Value) {
        self.values.lock().insert(key.into(), value);
    }

    /// Read a value synchronously
    pub fn snapshot(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().get(key).cloned()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.snapshot(key))
    }

    async fn set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.insert(key, value.clone());
        Ok(())
    }
}
