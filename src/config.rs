//! Configuration types for novel-tasks

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Download throttling and concurrency
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum chapter downloads in flight across all plugins (default: 3)
    #[serde(default = "default_max_global_concurrency")]
    pub max_global_concurrency: usize,

    /// Default per-plugin ceiling, 0 means "use the global ceiling" (default: 1)
    #[serde(default = "default_max_concurrent_per_plugin")]
    pub max_concurrent_per_plugin: usize,

    /// Per-plugin overrides of `max_concurrent_per_plugin`
    #[serde(default)]
    pub plugin_concurrency: HashMap<String, usize>,

    /// Minimum spacing between two download starts on the same plugin (default: 1000 ms)
    #[serde(default = "default_base_delay", with = "duration_ms_serde")]
    pub base_delay: Duration,

    /// Lower bound of the random delay added to `base_delay` (default: 0 ms)
    #[serde(default, with = "duration_ms_serde")]
    pub min_jitter: Duration,

    /// Upper bound of the random delay added to `base_delay` (default: 500 ms)
    #[serde(default = "default_max_jitter", with = "duration_ms_serde")]
    pub max_jitter: Duration,

    /// Only download while on Wi-Fi (default: false)
    #[serde(default)]
    pub only_on_wifi: bool,

    /// Queue downloads for chapters discovered by a library update (default: false)
    #[serde(default)]
    pub download_new_chapters: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_global_concurrency: default_max_global_concurrency(),
            max_concurrent_per_plugin: default_max_concurrent_per_plugin(),
            plugin_concurrency: HashMap::new(),
            base_delay: default_base_delay(),
            min_jitter: Duration::ZERO,
            max_jitter: default_max_jitter(),
            only_on_wifi: false,
            download_new_chapters: false,
        }
    }
}

impl DownloadConfig {
    /// Global ceiling, never below one
    pub fn global_limit(&self) -> usize {
        self.max_global_concurrency.max(1)
    }

    /// Ceiling for one plugin: its override, else the default, and 0 falls back to the global ceiling
    pub fn plugin_limit(&self, plugin_id: &str) -> usize {
        let configured = self
            .plugin_concurrency
            .get(plugin_id)
            .copied()
            .filter(|limit| *limit > 0)
            .unwrap_or(self.max_concurrent_per_plugin);
        if configured == 0 {
            self.global_limit()
        } else {
            configured
        }
    }
}

/// Loop cadence and pause behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between loop iterations (default: 100 ms)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Random extra sleep added to each poll (default: 50 ms)
    #[serde(default = "default_poll_jitter", with = "duration_ms_serde")]
    pub poll_jitter: Duration,

    /// Resume automatically this long after `pause()` (None = stay paused)
    #[serde(default, with = "optional_duration_ms_serde")]
    pub auto_resume_after: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            poll_jitter: default_poll_jitter(),
            auto_resume_after: None,
        }
    }
}

/// Progress notification throttling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Deliver notifications at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum time between two deliveries (default: 1000 ms)
    #[serde(default = "default_min_interval", with = "duration_ms_serde")]
    pub min_interval: Duration,

    /// Deliver after this long even when progress barely moved (default: 2000 ms)
    #[serde(default = "default_max_interval", with = "duration_ms_serde")]
    pub max_interval: Duration,

    /// Progress movement that justifies a delivery after `min_interval` (default: 0.05)
    #[serde(default = "default_min_progress_delta")]
    pub min_progress_delta: f64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            min_progress_delta: default_min_progress_delta(),
        }
    }
}

/// Where and how the queue is persisted
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (default: "./novel-tasks.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Delay before a queue mutation is written (default: 300 ms)
    #[serde(default = "default_write_debounce", with = "duration_ms_serde")]
    pub write_debounce: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            write_debounce: default_write_debounce(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500 ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`TaskScheduler`](crate::TaskScheduler)
///
/// Fields are organized into logical sub-configs:
/// - [`download`](DownloadConfig) - concurrency ceilings, anti-hammering delays, Wi-Fi gating
/// - [`scheduler`](SchedulerConfig) - loop cadence, auto-resume
/// - [`notifications`](NotificationConfig) - progress throttling
/// - [`persistence`](PersistenceConfig) - database path, write debounce
/// - [`retry`](RetryConfig) - backoff for transient executor failures
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behaviour
    #[serde(default)]
    pub download: DownloadConfig,

    /// Loop behaviour
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Notification throttling
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Persistence settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Check the settings for values the scheduler cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.download.max_global_concurrency == 0 {
            return Err(config_error(
                "max_global_concurrency must be at least 1",
                "max_global_concurrency",
            ));
        }
        if self.download.max_jitter < self.download.min_jitter {
            return Err(config_error(
                "max_jitter must not be smaller than min_jitter",
                "max_jitter",
            ));
        }
        let delta = self.notifications.min_progress_delta;
        if !(delta > 0.0 && delta <= 1.0) {
            return Err(config_error(
                "min_progress_delta must be in (0, 1]",
                "min_progress_delta",
            ));
        }
        if self.notifications.min_interval > self.notifications.max_interval {
            return Err(config_error(
                "min_interval must not exceed max_interval",
                "min_interval",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff_multiplier must be at least 1.0",
                "backoff_multiplier",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn default_max_global_concurrency() -> usize {
    3
}

fn default_max_concurrent_per_plugin() -> usize {
    1
}

fn default_base_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_jitter() -> Duration {
    Duration::from_millis(500)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_poll_jitter() -> Duration {
    Duration::from_millis(50)
}

fn default_true() -> bool {
    true
}

fn default_min_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_min_progress_delta() -> f64 {
    0.05
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./novel-tasks.db")
}

fn default_write_debounce() -> Duration {
    Duration::from_millis(300)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper (milliseconds)
mod optional_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
