//! Wi-Fi gating.

use crate::types::ConnectionType;
use std::sync::atomic::Ordering;

use super::TaskScheduler;

/// Whether a link counts as unmetered for `only_on_wifi`
pub(crate) fn is_unmetered(connection: ConnectionType) -> bool {
    matches!(connection, ConnectionType::Wifi | ConnectionType::Ethernet)
}

impl TaskScheduler {
    /// Whether chapter downloads may start on the current connection
    pub(crate) fn allows_downloads(&self) -> bool {
        if !self.config.download.only_on_wifi {
            return true;
        }
        match &self.network {
            Some(rx) => is_unmetered(*rx.borrow()),
            None => true,
        }
    }

    /// Restart a run that stopped for lack of Wi-Fi once Wi-Fi returns
    pub(crate) fn spawn_network_listener(&self) {
        let Some(mut rx) = self.network.clone() else {
            return;
        };
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scheduler.control.shutdown_token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Network source closed");
                            break;
                        }
                    }
                }
                let connection = *rx.borrow_and_update();
                tracing::debug!(?connection, "Connection changed");
                if is_unmetered(connection)
                    && scheduler
                        .control
                        .waiting_for_network
                        .swap(false, Ordering::SeqCst)
                {
                    tracing::info!(?connection, "Unmetered connection available, resuming downloads");
                    scheduler.start();
                }
            }
        });
    }
}
