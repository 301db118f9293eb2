//! Save status reporting.
//!
//! Provides `SaveStatus` (what the UI indicator shows), `SaveEvent` for
//! monitoring, and `EventBus` for subscriptions.

use crate::memo::Memo;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// User-visible save state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SaveStatus {
    /// Nothing to save yet.
    Idle,
    /// A write is in flight.
    Saving,
    /// The latest write was acknowledged.
    Saved { version: u64 },
    /// Retries exhausted or the store refused the write. Pending content is
    /// kept and retried on the next edit or reconnect.
    Error { message: String },
    /// No connectivity; content is held until it returns.
    Offline,
    /// Another writer advanced the memo. Nothing is written until resolved.
    Conflict {
        #[serde(rename = "remoteVersion")]
        remote_version: u64,
    },
}

impl SaveStatus {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveStatus::Saved { .. })
    }
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SaveEvent {
    /// The status indicator changed.
    StatusChanged {
        status: SaveStatus,
        /// Milliseconds since Unix epoch.
        timestamp: i64,
    },
    /// A response for a superseded edit was dropped.
    StaleResponse { seq: u64 },
    /// Another tab reported a newer remote version.
    RemoteVersionObserved { version: u64 },
    /// The shadow was re-read from the store before a write. Carries the
    /// shadow as it now stands (still unfetched if the memo does not exist).
    ShadowRefreshed { memo: Memo },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SaveEvent) + Send + Sync>;

/// Event bus for publishing save events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SaveEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SaveEvent) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
