//! Page lifecycle hooks.
//!
//! The host reports when the editor is hidden or about to go away; the
//! session answers with a bounded flush of the latest editor content.
//!
//! Implementations of the `LifecycleSignal` port:
//! - `LocalLifecycle` - fired by the host (the CLI fires `Unload` on Ctrl+C)
//! - `NoopLifecycle` - never fires

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The editor is no longer visible (tab switched, window minimised).
    Hidden,
    /// The editor is about to be torn down.
    Unload,
}

pub trait LifecycleSignal: Send + Sync {
    /// Subscribe to lifecycle events. `None` when the host has none.
    fn subscribe(&self) -> Option<broadcast::Receiver<LifecycleEvent>>;
}

#[derive(Debug, Clone)]
pub struct LocalLifecycle {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LocalLifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self { tx }
    }

    pub fn fire(&self, event: LifecycleEvent) {
        tracing::debug!("Lifecycle event {:?}", event);
        // No subscribers just means no session is attached
        let _ = self.tx.send(event);
    }
}

impl Default for LocalLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSignal for LocalLifecycle {
    fn subscribe(&self) -> Option<broadcast::Receiver<LifecycleEvent>> {
        Some(self.tx.subscribe())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl LifecycleSignal for NoopLifecycle {
    fn subscribe(&self) -> Option<broadcast::Receiver<LifecycleEvent>> {
        None
    }
}

/// Latest editor content, written synchronously on every keystroke so a
/// lifecycle flush never has to ask the editor.
#[derive(Debug, Clone, Default)]
pub struct EditorRef {
    inner: Arc<RwLock<Option<EditorContent>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorContent {
    pub title: String,
    pub content: String,
}

impl EditorRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, title: &str, content: &str) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(EditorContent {
            title: title.to_string(),
            content: content.to_string(),
        });
    }

    /// `None` until the first edit.
    pub fn get(&self) -> Option<EditorContent> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
