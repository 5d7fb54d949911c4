//! Progress notifications
//!
//! Executors may report progress at any rate. [`ThrottledNotifier`] turns that
//! stream into occasional writes to a [`NotificationSink`], while guaranteeing
//! the most recent values are always delivered eventually.

use crate::config::NotificationConfig;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Action button attached to the ongoing notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationAction {
    /// Pause the scheduler
    Pause,
    /// Resume the scheduler
    Resume,
    /// Cancel the current task
    Cancel,
}

/// One user-visible notification
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Headline
    pub title: String,
    /// Body text
    pub description: String,
    /// Progress in `[0, 1]`; `None` shows no progress bar
    pub progress: Option<f64>,
    /// Optional action button
    pub action: Option<NotificationAction>,
}

/// Delivery target for notifications (an OS notification surface, a UI, a log)
///
/// Delivery is fire-and-forget: errors are logged and otherwise ignored.
pub trait NotificationSink: Send + Sync {
    /// Show or replace the notification
    fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Sink that writes notifications to the tracing log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            title = %notification.title,
            progress = ?notification.progress,
            "{}",
            notification.description
        );
        Ok(())
    }
}

/// Outcome of the throttle decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Now,
    After(Duration),
}

/// Decide whether an update goes out now or waits for the trailing timer
pub(crate) fn throttle(
    config: &NotificationConfig,
    last: Option<(Instant, Option<f64>)>,
    now: Instant,
    progress: Option<f64>,
    force: bool,
) -> Delivery {
    let Some((last_time, last_progress)) = last else {
        return Delivery::Now;
    };
    if force || progress.is_some_and(|p| p >= 1.0) {
        return Delivery::Now;
    }

    let elapsed = now.saturating_duration_since(last_time);
    let delta = match (progress, last_progress) {
        (Some(p), Some(lp)) => (p - lp).abs(),
        (Some(_), None) => 1.0,
        (None, _) => 0.0,
    };

    if elapsed >= config.min_interval
        && (delta >= config.min_progress_delta || elapsed >= config.max_interval)
    {
        return Delivery::Now;
    }

    if elapsed < config.min_interval {
        Delivery::After(config.min_interval - elapsed)
    } else {
        Delivery::After(config.max_interval.saturating_sub(elapsed))
    }
}

#[derive(Default)]
struct ThrottleState {
    last: Option<(Instant, Option<f64>)>,
    pending: Option<Notification>,
    timer_armed: bool,
    action: Option<NotificationAction>,
}

/// Coalescing front of a [`NotificationSink`] (cloneable - state is shared)
#[derive(Clone)]
pub struct ThrottledNotifier {
    config: NotificationConfig,
    sink: Arc<dyn NotificationSink>,
    state: Arc<Mutex<ThrottleState>>,
}

impl ThrottledNotifier {
    /// Wrap a sink
    pub fn new(config: NotificationConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            config,
            sink,
            state: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    /// Set the action button used by subsequent updates
    pub fn set_action(&self, action: Option<NotificationAction>) {
        self.state.lock().action = action;
    }

    /// Report the current state
    ///
    /// Goes out immediately when forced, on the first update, at completion, or
    /// when the throttle window allows; otherwise the values are kept and a
    /// single trailing timer delivers the latest ones later.
    pub fn update(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        progress: Option<f64>,
        force: bool,
    ) {
        if !self.config.enabled {
            return;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let notification = Notification {
            title: title.into(),
            description: description.into(),
            progress: progress.map(|p| p.clamp(0.0, 1.0)),
            action: state.action,
        };

        match throttle(&self.config, state.last, now, notification.progress, force) {
            Delivery::Now => {
                state.last = Some((now, notification.progress));
                state.pending = None;
                drop(state);
                self.write(&notification);
            }
            Delivery::After(wait) => {
                state.pending = Some(notification);
                if state.timer_armed {
                    return;
                }
                state.timer_armed = true;
                drop(state);
                self.arm_trailing(wait);
            }
        }
    }

    fn arm_trailing(&self, wait: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.state.lock().timer_armed = false;
            self.flush_pending();
            return;
        };

        let notifier = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            notifier.state.lock().timer_armed = false;
            notifier.flush_pending();
        });
    }

    fn flush_pending(&self) {
        let pending = {
            let mut state = self.state.lock();
            let pending = state.pending.take();
            if let Some(ref n) = pending {
                state.last = Some((Instant::now(), n.progress));
            }
            pending
        };
        if let Some(notification) = pending {
            self.write(&notification);
        }
    }

    /// Deliver a standalone notification, bypassing the throttle
    pub fn notify_once(&self, title: impl Into<String>, description: impl Into<String>) {
        if !self.config.enabled {
            return;
        }
        self.write(&Notification {
            title: title.into(),
            description: description.into(),
            progress: None,
            action: None,
        });
    }

    /// Forget throttle history so the next update goes out immediately
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last = None;
        state.pending = None;
    }

    fn write(&self, notification: &Notification) {
        if let Err(e) = self.sink.deliver(notification) {
            tracing::warn!(error = %e, title = %notification.title, "Notification delivery failed");
        }
    }
}
