//! Retry logic with exponential backoff
//!
//! Executors wrap unreliable I/O (plugin fetches, storage writes that may hit a
//! momentary lock) in [`with_retry`]. Delays grow exponentially and may be
//! jittered so that parallel chapter downloads do not retry in lockstep.
//!
//! # Example
//!
//! ```no_run
//! use novel_tasks::retry::{IsRetryable, with_retry};
//! use novel_tasks::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let result = with_retry(&config, || async {
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DatabaseError, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connection resets, a busy store) should return `true`.
/// Permanent failures (missing chapter, parse error, cancellation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "busy",
    "temporary",
    "temporarily",
    "429",
    "502",
    "503",
    "504",
];

fn looks_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Plugin { message, .. } => looks_transient(message),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            // A locked SQLite file clears up on its own
            Error::Database(DatabaseError::QueryFailed(msg)) => {
                let lower = msg.to_lowercase();
                lower.contains("locked") || lower.contains("busy")
            }
            Error::Sqlx(sqlx::Error::PoolTimedOut) => true,
            Error::Tracker(msg) => looks_transient(msg),
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Config { .. }
            | Error::Serialization(_)
            | Error::PluginNotFound(_)
            | Error::NovelNotFound(_)
            | Error::ChapterNotFound(_)
            | Error::Speech(_)
            | Error::Cancelled
            | Error::NotDispatchable(_)
            | Error::TaskNotFound(_)
            | Error::ShuttingDown
            | Error::Other(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
/// `config.max_attempts` counts retries, so the operation runs at most `max_attempts + 1` times.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::debug!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
