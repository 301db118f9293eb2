//! Online/offline tracking.
//!
//! The host feeds "became online" / "became offline" events into
//! `ConnectivityMonitor::set_online`. Consumers either read the current
//! state or await transitions through a `ConnectivityWatcher`.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a host connectivity event. Repeated events are ignored.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn subscribe(&self) -> ConnectivityWatcher {
        let mut rx = self.tx.subscribe();
        rx.mark_unchanged();
        ConnectivityWatcher { rx }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Receiving side of connectivity transitions.
pub struct ConnectivityWatcher {
    rx: watch::Receiver<bool>,
}

impl ConnectivityWatcher {
    /// Wait for the next transition and return the new state.
    ///
    /// Returns `None` once every monitor handle has been dropped.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
