//! Cross-tab coordination for tabs editing the same memo.
//!
//! Tabs announce when they start editing and when they saved a new version.
//! Messages are advisory: a tab that learns of a newer version marks its
//! shadow stale and refreshes before its next write.
//!
//! Implementations of the `TabBus` port:
//! - `LocalTabBus` - in-process broadcast hub; each session is a "tab"
//! - `NoopTabBus` - no cross-tab awareness

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum TabBusError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// Message exchanged between tabs over a per-document channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TabMessage {
    /// Another tab started editing.
    Editing {
        #[serde(rename = "tabId")]
        tab_id: String,
    },
    /// Another tab saved the memo at `version`.
    Saved { version: u64 },
}

/// A message tagged with the tab that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabEnvelope {
    pub origin: String,
    pub message: TabMessage,
}

/// Broadcast transport between tabs.
pub trait TabBus: Send + Sync {
    fn publish(&self, channel: &str, envelope: TabEnvelope) -> Result<(), TabBusError>;

    /// Subscribe to a channel. `None` means the host has no broadcast
    /// mechanism; callers degrade to no cross-tab awareness.
    fn subscribe(&self, channel: &str) -> Option<broadcast::Receiver<TabEnvelope>>;
}

/// In-process hub. Clone the `Arc` into every session that should see the
/// others.
#[derive(Default)]
pub struct LocalTabBus {
    channels: Mutex<HashMap<String, broadcast::Sender<TabEnvelope>>>,
}

impl LocalTabBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<TabEnvelope> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl TabBus for LocalTabBus {
    fn publish(&self, channel: &str, envelope: TabEnvelope) -> Result<(), TabBusError> {
        // No subscribers is not an error: there are simply no other tabs
        let _ = self.sender(channel).send(envelope);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Option<broadcast::Receiver<TabEnvelope>> {
        Some(self.sender(channel).subscribe())
    }
}

/// Bus for hosts without a broadcast mechanism.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTabBus;

impl TabBus for NoopTabBus {
    fn publish(&self, _channel: &str, _envelope: TabEnvelope) -> Result<(), TabBusError> {
        Ok(())
    }

    fn subscribe(&self, _channel: &str) -> Option<broadcast::Receiver<TabEnvelope>> {
        None
    }
}

pub fn tab_channel(document_id: &str) -> String {
    format!("memo-sync:{}", document_id)
}

/// Publishing half of a tab's channel. Cheap to clone.
#[derive(Clone)]
pub struct TabAnnouncer {
    bus: Arc<dyn TabBus>,
    channel: String,
    tab_id: String,
}

impl TabAnnouncer {
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn announce_editing(&self) {
        self.publish(TabMessage::Editing {
            tab_id: self.tab_id.clone(),
        });
    }

    pub fn announce_saved(&self, version: u64) {
        self.publish(TabMessage::Saved { version });
    }

    fn publish(&self, message: TabMessage) {
        let envelope = TabEnvelope {
            origin: self.tab_id.clone(),
            message,
        };
        if let Err(e) = self.bus.publish(&self.channel, envelope) {
            warn!("Failed to publish on {}: {}", self.channel, e);
        }
    }
}

/// One tab's view of the per-document channel.
pub struct TabSync {
    announcer: TabAnnouncer,
    rx: Option<broadcast::Receiver<TabEnvelope>>,
}

impl TabSync {
    pub fn new(bus: Arc<dyn TabBus>, document_id: &str) -> Self {
        let channel = tab_channel(document_id);
        let rx = bus.subscribe(&channel);
        if rx.is_none() {
            debug!("No tab bus for {}, cross-tab sync disabled", channel);
        }
        Self {
            announcer: TabAnnouncer {
                bus,
                channel,
                tab_id: Uuid::new_v4().to_string(),
            },
            rx,
        }
    }

    pub fn tab_id(&self) -> &str {
        self.announcer.tab_id()
    }

    pub fn announcer(&self) -> TabAnnouncer {
        self.announcer.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.rx.is_some()
    }

    pub fn announce_editing(&self) {
        self.announcer.announce_editing();
    }

    pub fn announce_saved(&self, version: u64) {
        self.announcer.announce_saved(version);
    }

    /// Next message from another tab.
    ///
    /// Never resolves when the bus is unavailable or closed, so it can sit in
    /// a `select!` loop unconditionally.
    pub async fn next_message(&mut self) -> TabMessage {
        loop {
            let Some(rx) = self.rx.as_mut() else {
                return futures::future::pending().await;
            };
            match rx.recv().await {
                Ok(envelope) if envelope.origin == self.announcer.tab_id => continue,
                Ok(envelope) => return envelope.message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Tab channel {} lagged, skipped {} message(s)",
                        self.announcer.channel, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Tab channel {} closed", self.announcer.channel);
                    self.rx = None;
                }
            }
        }
    }
}
