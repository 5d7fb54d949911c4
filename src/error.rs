//! Error types for novel-tasks
//!
//! Every catch site in the scheduler is local to a single task, so these errors
//! describe one task's failure (or one persistence operation) rather than the
//! health of the scheduler as a whole.

use crate::types::{TaskId, TaskKind};
use thiserror::Error;

/// Result type alias for novel-tasks operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for novel-tasks
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_global_concurrency")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A source plugin failed (network, parse error, ...)
    #[error("plugin {plugin_id} failed: {message}")]
    Plugin {
        /// Plugin that produced the error
        plugin_id: String,
        /// Error message reported by the plugin
        message: String,
    },

    /// No plugin is installed under this id
    #[error("plugin not installed: {0}")]
    PluginNotFound(String),

    /// Novel missing from the library
    #[error("novel {0} not found")]
    NovelNotFound(i64),

    /// Chapter missing from the library
    #[error("chapter {0} not found")]
    ChapterNotFound(i64),

    /// Tracker service failure
    #[error("tracker error: {0}")]
    Tracker(String),

    /// Speech engine failure
    #[error("speech error: {0}")]
    Speech(String),

    /// The task was cancelled while it was executing
    #[error("task cancelled")]
    Cancelled,

    /// The task kind is not executed through the executor table
    #[error("{0} tasks are not dispatched to executors")]
    NotDispatchable(TaskKind),

    /// Task not found in the queue
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Shutdown in progress - not accepting new tasks
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a plugin error from anything displayable
    pub fn plugin(plugin_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Plugin {
            plugin_id: plugin_id.into(),
            message: message.to_string(),
        }
    }

    /// Returns true for cooperative cancellation.
    ///
    /// Cancellation is bookkept like any other failure but is never surfaced
    /// as a failure notification.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}
