//! Session: one editor attached to one memo.
//!
//! Wires the ports together, owns the coordinator and runs the event loop
//! that turns host signals (connectivity, other tabs, lifecycle) into
//! coordinator calls.

use crate::backup::{BackupStore, LocalBackup};
use crate::client::{SaveClient, SaveError};
use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityWatcher};
use crate::coordinator::{CoordinatorParts, CoordinatorSnapshot, Resolution, SaveCoordinator};
use crate::events::{EventBus, SaveEvent, SaveStatus, Subscription};
use crate::kv::KeyValueStore;
use crate::lifecycle::{EditorRef, LifecycleEvent, LifecycleSignal};
use crate::memo::Memo;
use crate::store::{MemoStore, StoreError};
use crate::tab::{TabBus, TabMessage, TabSync};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to load memo {document_id}: {source}")]
    Load {
        document_id: String,
        source: SaveError,
    },

    #[error("Session for {0} is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Save(#[from] SaveError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Host-provided implementations of every port.
#[derive(Clone)]
pub struct SessionPorts {
    pub store: Arc<dyn MemoStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub tabs: Arc<dyn TabBus>,
    pub lifecycle: Arc<dyn LifecycleSignal>,
    pub connectivity: ConnectivityMonitor,
}

/// A local backup newer than the remote copy, found on attach (or on the
/// first fetch, when attach could not reach the store).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOffer {
    pub backup: LocalBackup,
    pub remote_version: u64,
}

/// Receivers consumed by `run`.
struct Signals {
    tabs: TabSync,
    connectivity: ConnectivityWatcher,
    lifecycle: Option<broadcast::Receiver<LifecycleEvent>>,
}

pub struct Session {
    document_id: String,
    coordinator: Arc<SaveCoordinator>,
    backups: BackupStore,
    editor: EditorRef,
    tab_id: String,
    unload_deadline: Duration,
    restore_offer: Arc<Mutex<Option<RestoreOffer>>>,
    /// Attach could not fetch the remote; the backup is checked against the
    /// first fetch instead.
    offer_deferred: Arc<AtomicBool>,
    signals: Mutex<Option<Signals>>,
    _offer_check: Subscription,
}

impl Session {
    /// Load the memo and prepare to autosave it.
    ///
    /// When offline, or when the store is temporarily unreachable, the
    /// session starts from an empty shadow at version 0 and fetches before
    /// its first write. Any backup is then only offered once that fetch shows
    /// it is newer than the remote.
    pub async fn attach(config: &EngineConfig, document_id: &str, ports: SessionPorts) -> Result<Self> {
        let client = SaveClient::new(ports.store.clone(), document_id);
        let policy = config.retry_policy();

        let (shadow, fetched) = if ports.connectivity.is_online() {
            match client.refresh_within(policy.attempt_timeout).await {
                Ok(memo) => (memo, true),
                Err(SaveError::Rejected(StoreError::NotFound(_))) => {
                    info!("Memo {} does not exist yet, starting empty", document_id);
                    (Memo::unfetched(document_id), true)
                }
                Err(SaveError::Transient(e)) => {
                    warn!("Could not load memo {} ({}), deferring fetch", document_id, e);
                    (Memo::unfetched(document_id), false)
                }
                Err(source) => {
                    return Err(SessionError::Load {
                        document_id: document_id.to_string(),
                        source,
                    });
                }
            }
        } else {
            info!("Offline, deferring fetch of memo {}", document_id);
            (Memo::unfetched(document_id), false)
        };

        let backups = BackupStore::new(ports.kv.clone());
        let restore_offer = if fetched {
            offer_restore(&backups, &shadow)
        } else {
            None
        };

        let tabs = TabSync::new(ports.tabs.clone(), document_id);
        let tab_id = tabs.tab_id().to_string();
        let coordinator = Arc::new(SaveCoordinator::new(
            shadow,
            CoordinatorParts {
                client,
                backups: backups.clone(),
                connectivity: ports.connectivity.clone(),
                announcer: tabs.announcer(),
                events: Arc::new(EventBus::new()),
                policy,
            },
        ));
        if !fetched {
            coordinator.mark_shadow_stale();
        }

        let restore_offer = Arc::new(Mutex::new(restore_offer));
        let offer_deferred = Arc::new(AtomicBool::new(!fetched));
        let offer_check = coordinator.events().subscribe({
            let backups = backups.clone();
            let restore_offer = restore_offer.clone();
            let offer_deferred = offer_deferred.clone();
            move |event| {
                let SaveEvent::ShadowRefreshed { memo } = event else {
                    return;
                };
                if offer_deferred.swap(false, Ordering::SeqCst) {
                    let offer = offer_restore(&backups, &memo);
                    *restore_offer.lock().unwrap_or_else(|e| e.into_inner()) = offer;
                }
            }
        });

        info!(
            "Attached to memo {} at version {} (tab {})",
            document_id,
            coordinator.shadow().version,
            tab_id
        );

        Ok(Self {
            document_id: document_id.to_string(),
            coordinator,
            backups,
            editor: EditorRef::new(),
            tab_id,
            unload_deadline: config.unload_deadline(),
            restore_offer,
            offer_deferred,
            signals: Mutex::new(Some(Signals {
                tabs,
                connectivity: ports.connectivity.subscribe(),
                lifecycle: ports.lifecycle.subscribe(),
            })),
            _offer_check: offer_check,
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn coordinator(&self) -> &Arc<SaveCoordinator> {
        &self.coordinator
    }

    pub fn editor(&self) -> &EditorRef {
        &self.editor
    }

    pub fn status(&self) -> SaveStatus {
        self.coordinator.status()
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        self.coordinator.snapshot()
    }

    pub fn shadow(&self) -> Memo {
        self.coordinator.shadow()
    }

    pub fn subscribe(&self, callback: impl Fn(SaveEvent) + Send + Sync + 'static) -> Subscription {
        self.coordinator.events().subscribe(callback)
    }

    // ==================== Editing ====================

    /// Record a keystroke-level edit and autosave it.
    pub async fn edit(&self, title: &str, content: &str) {
        self.record_edit(title, content);
        self.coordinator.resume().await;
    }

    /// Record an edit without waiting for it to be saved.
    ///
    /// Call in the order edits happen, then `coordinator().resume()` from
    /// wherever is convenient.
    pub fn record_edit(&self, title: &str, content: &str) {
        // The edit overwrites the backup the deferred check would have offered
        if self.offer_deferred.swap(false, Ordering::SeqCst) {
            debug!("Edited {} before its first fetch, no backup to offer", self.document_id);
        }
        self.editor.set(title, content);
        self.coordinator.record(title, content);
    }

    pub fn restore_offer(&self) -> Option<RestoreOffer> {
        self.lock_offer().clone()
    }

    /// Restore the offered backup into the editor and save it.
    ///
    /// Returns the restored backup, `None` if there was no offer.
    pub async fn accept_restore(&self) -> Option<LocalBackup> {
        let offer = self.lock_offer().take()?;
        let title = offer
            .backup
            .title
            .clone()
            .unwrap_or_else(|| self.coordinator.shadow().title);
        info!("Restoring backup of {}", self.document_id);
        self.edit(&title, &offer.backup.content).await;
        Some(offer.backup)
    }

    /// Drop the offered backup.
    pub fn discard_restore(&self) {
        if self.lock_offer().take().is_some() {
            info!("Discarded backup of {}", self.document_id);
            self.backups.clear(&self.document_id);
        }
    }

    pub async fn resolve_conflict(&self, resolution: Resolution) -> Result<Option<Memo>> {
        let remote = self.coordinator.resolve_conflict(resolution).await?;
        if let Some(memo) = &remote {
            self.editor.set(&memo.title, &memo.content);
        }
        Ok(remote)
    }

    // ==================== Event loop ====================

    /// React to host signals until `shutdown` resolves or the host unloads.
    ///
    /// Can only run once per session.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut signals = self
            .signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| SessionError::AlreadyRunning(self.document_id.clone()))?;

        tokio::pin!(shutdown);
        let mut watching_connectivity = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Session {} shutting down", self.document_id);
                    break;
                }

                online = signals.connectivity.changed(), if watching_connectivity => match online {
                    Some(true) => {
                        let coordinator = self.coordinator.clone();
                        tokio::spawn(async move { coordinator.resume().await });
                    }
                    Some(false) => debug!("Offline, saves of {} will wait", self.document_id),
                    None => watching_connectivity = false,
                },

                message = signals.tabs.next_message() => match message {
                    TabMessage::Saved { version } => self.coordinator.observe_remote_version(version),
                    TabMessage::Editing { tab_id } => {
                        debug!("Tab {} is editing {}", tab_id, self.document_id);
                    }
                },

                event = next_lifecycle(&mut signals.lifecycle) => {
                    let saved = self.flush_latest().await;
                    debug!("Flush on {:?} of {} finished (saved: {})", event, self.document_id, saved);
                    if event == LifecycleEvent::Unload {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Final bounded flush. Returns `true` when nothing is left unsaved.
    pub async fn detach(&self) -> bool {
        let saved = self.coordinator.flush(self.unload_deadline).await;
        if saved {
            info!("Detached from memo {}", self.document_id);
        } else {
            warn!(
                "Detached from memo {} with unsaved changes (kept in local backup)",
                self.document_id
            );
        }
        saved
    }

    /// Enqueue the editor's latest content and flush, all within
    /// `unload_deadline`.
    async fn flush_latest(&self) -> bool {
        let started = tokio::time::Instant::now();

        // A conflict waits for the user; the backup already holds the content
        if self.coordinator.snapshot().conflict.is_none() {
            if let Some(latest) = self.editor.get() {
                let enqueue = self.coordinator.enqueue(&latest.title, &latest.content);
                if tokio::time::timeout(self.unload_deadline, enqueue).await.is_err() {
                    warn!("Flush of {} did not finish within {:?}", self.document_id, self.unload_deadline);
                    return false;
                }
            }
        }

        let remaining = self.unload_deadline.saturating_sub(started.elapsed());
        self.coordinator.flush(remaining).await
    }

    fn lock_offer(&self) -> std::sync::MutexGuard<'_, Option<RestoreOffer>> {
        self.restore_offer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Offer `backups`' snapshot if it is newer than `remote`.
fn offer_restore(backups: &BackupStore, remote: &Memo) -> Option<RestoreOffer> {
    let backup = backups.restorable(remote)?;
    info!(
        "Found unsaved backup for {} from {} (remote at version {})",
        remote.id, backup.timestamp, remote.version
    );
    Some(RestoreOffer {
        backup,
        remote_version: remote.version,
    })
}

/// Next lifecycle event. Never resolves without a lifecycle source.
async fn next_lifecycle(rx: &mut Option<broadcast::Receiver<LifecycleEvent>>) -> LifecycleEvent {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return futures::future::pending().await;
        };
        match receiver.recv().await {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Lifecycle channel lagged, skipped {} event(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => *rx = None,
        }
    }
}
