//! SaveCoordinator: single-flight save queue for one memo.
//!
//! States:
//!
//! ```text
//!            enqueue (online)                 write settles, nothing pending
//!   Idle ─────────────────────────> Saving ─────────────────────────────> Idle
//!    ▲                               │  ▲
//!    │ resolve / next edit           │  └── write settles, trailing edit pending
//!    │                               ▼
//!   IdleWithPending <──── offline, error, conflict
//! ```
//!
//! Every edit replaces the single trailing slot, so only the newest content
//! is ever sent. Whoever finds the coordinator idle becomes the *driver* and
//! keeps dispatching the trailing slot until it is empty; everyone else just
//! leaves their edit in the slot and returns. The decision is made under the
//! state lock, so two callers can never both drive.
//!
//! The lock is never held across an `.await`.

use crate::backup::BackupStore;
use crate::client::{SaveClient, SaveError, WriteOutcome};
use crate::connectivity::ConnectivityMonitor;
use crate::events::{EventBus, SaveEvent, SaveStatus};
use crate::memo::{Memo, SaveRequest};
use crate::retry::{self, RetryError, RetryPolicy};
use crate::store::StoreError;
use crate::tab::TabAnnouncer;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Saving,
    /// Content is waiting but nothing is in flight (offline, error, conflict).
    IdleWithPending,
}

/// How to leave a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Write the local content against the refreshed remote version.
    KeepLocal,
    /// Drop local content and adopt the remote memo.
    AcceptRemote,
}

/// A write that was rejected because the remote moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Version the store reported, when it did.
    pub remote_version: Option<u64>,
    /// Remote memo fetched right after the conflict. `None` if that fetch
    /// failed.
    pub remote: Option<Memo>,
}

impl Conflict {
    fn version(&self, fallback: u64) -> u64 {
        self.remote
            .as_ref()
            .map(|m| m.version)
            .or(self.remote_version)
            .unwrap_or(fallback)
    }
}

/// Point-in-time view of the coordinator, for the UI and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub state: CoordinatorState,
    pub status: SaveStatus,
    pub shadow_version: u64,
    pub shadow_stale: bool,
    pub pending_seq: Option<u64>,
    pub in_flight_seq: Option<u64>,
    pub conflict: Option<Conflict>,
}

struct Inner {
    shadow: Memo,
    next_seq: u64,
    /// Trailing slot: newest edit not yet dispatched.
    pending: Option<SaveRequest>,
    in_flight: Option<u64>,
    saving: bool,
    /// Another tab saved a newer version; refresh before writing.
    shadow_stale: bool,
    /// The user chose local content over a conflicting remote; the next
    /// stale refresh adopts the remote version without raising a conflict.
    keep_local: bool,
    conflict: Option<Conflict>,
    status: SaveStatus,
}

/// Collaborators a coordinator needs.
pub struct CoordinatorParts {
    pub client: SaveClient,
    pub backups: BackupStore,
    pub connectivity: ConnectivityMonitor,
    pub announcer: TabAnnouncer,
    pub events: Arc<EventBus>,
    pub policy: RetryPolicy,
}

pub struct SaveCoordinator {
    document_id: String,
    client: SaveClient,
    backups: BackupStore,
    connectivity: ConnectivityMonitor,
    announcer: TabAnnouncer,
    events: Arc<EventBus>,
    policy: RetryPolicy,
    inner: Mutex<Inner>,
    busy: watch::Sender<bool>,
}

impl SaveCoordinator {
    /// Create a coordinator whose shadow starts at `shadow`.
    ///
    /// The shadow's content is recorded as already saved, so re-sending it
    /// costs nothing.
    pub fn new(shadow: Memo, parts: CoordinatorParts) -> Self {
        parts.client.mark_saved(shadow.hash());
        let (busy, _rx) = watch::channel(false);
        Self {
            document_id: shadow.id.clone(),
            client: parts.client,
            backups: parts.backups,
            connectivity: parts.connectivity,
            announcer: parts.announcer,
            events: parts.events,
            policy: parts.policy,
            inner: Mutex::new(Inner {
                shadow,
                next_seq: 0,
                pending: None,
                in_flight: None,
                saving: false,
                shadow_stale: false,
                keep_local: false,
                conflict: None,
                status: SaveStatus::Idle,
            }),
            busy,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let inner = self.lock();
        CoordinatorSnapshot {
            state: Self::state_of(&inner),
            status: inner.status.clone(),
            shadow_version: inner.shadow.version,
            shadow_stale: inner.shadow_stale,
            pending_seq: inner.pending.as_ref().map(|r| r.seq),
            in_flight_seq: inner.in_flight,
            conflict: inner.conflict.clone(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        Self::state_of(&self.lock())
    }

    pub fn status(&self) -> SaveStatus {
        self.lock().status.clone()
    }

    /// Current shadow memo.
    pub fn shadow(&self) -> Memo {
        self.lock().shadow.clone()
    }

    // ==================== Operations ====================

    /// Record an edit and save it when possible.
    ///
    /// Returns once this call's dispatch work is done: immediately if another
    /// caller is already driving the queue, otherwise after the queue drains
    /// or parks.
    pub async fn enqueue(&self, title: &str, content: &str) {
        self.record(title, content);
        self.resume().await;
    }

    /// Stage an edit in the trailing slot without dispatching it.
    ///
    /// Edits are numbered in the order they are recorded. A host that
    /// receives edits on one task records them there, in order, and leaves
    /// only `resume` to run in the background.
    pub fn record(&self, title: &str, content: &str) {
        let starting = self.update(|inner| {
            let starting = inner.pending.is_none() && !inner.saving;

            // Backup under the lock so a concurrent success cannot clear it
            self.backups.save(&self.document_id, title, content);

            inner.next_seq += 1;
            let request = SaveRequest::new(title, content, inner.next_seq);
            if let Some(superseded) = inner.pending.replace(request) {
                debug!(
                    "Coalesced seq {} into seq {} for {}",
                    superseded.seq, inner.next_seq, self.document_id
                );
            }

            if inner.conflict.take().is_some() {
                inner.keep_local = true;
                info!(
                    "Edit after conflict on {}, writing against version {}",
                    self.document_id, inner.shadow.version
                );
            }

            starting
        });

        if starting {
            self.announcer.announce_editing();
        }
    }

    /// Dispatch what is parked: a staged edit, or a shadow that still has
    /// to be fetched. Called after connectivity returns and after `record`.
    pub async fn resume(&self) {
        if self.update(|inner| self.try_begin(inner)) {
            self.drive().await;
        }
    }

    /// Save whatever is pending, waiting at most `deadline`.
    ///
    /// Returns `true` when nothing is left unsaved. On timeout the in-flight
    /// attempt is cancelled and its content stays pending (and backed up).
    pub async fn flush(&self, deadline: Duration) -> bool {
        let work = async {
            self.wait_idle().await;
            self.resume().await;
            self.wait_idle().await;
        };

        if tokio::time::timeout(deadline, work).await.is_err() {
            warn!(
                "Flush of {} did not finish within {:?}",
                self.document_id, deadline
            );
            return false;
        }

        let inner = self.lock();
        inner.pending.is_none() && !inner.saving
    }

    /// Refresh the shadow before the next write, e.g. when it was never
    /// fetched.
    pub fn mark_shadow_stale(&self) {
        self.update(|inner| inner.shadow_stale = true);
    }

    /// Another instance saved `version`. Marks the shadow stale if it is
    /// newer than ours.
    pub fn observe_remote_version(&self, version: u64) {
        let newer = self.update(|inner| {
            if version > inner.shadow.version {
                inner.shadow_stale = true;
                true
            } else {
                false
            }
        });

        if newer {
            info!(
                "Memo {} saved at version {} elsewhere, refreshing before next write",
                self.document_id, version
            );
            self.events.emit(SaveEvent::RemoteVersionObserved { version });
        }
    }

    /// Leave the conflict state.
    ///
    /// Returns the memo the UI should now show: the remote one for
    /// `AcceptRemote`, `None` for `KeepLocal`.
    pub async fn resolve_conflict(&self, resolution: Resolution) -> Result<Option<Memo>, SaveError> {
        match resolution {
            Resolution::KeepLocal => {
                let drive = self.update(|inner| {
                    if inner.conflict.take().is_none() {
                        return false;
                    }
                    inner.keep_local = true;
                    self.try_begin(inner)
                });
                if drive {
                    self.drive().await;
                }
                Ok(None)
            }
            Resolution::AcceptRemote => {
                let known = self.lock().conflict.as_ref().and_then(|c| c.remote.clone());
                let remote = match known {
                    Some(memo) => memo,
                    None => self.fetch_remote().await?,
                };

                self.update(|inner| {
                    inner.conflict = None;
                    inner.pending = None;
                    inner.shadow_stale = false;
                    inner.keep_local = false;
                    inner.shadow = remote.clone();
                    inner.status = SaveStatus::Saved {
                        version: remote.version,
                    };
                    self.client.mark_saved(remote.hash());
                    self.backups.clear(&self.document_id);
                });
                info!(
                    "Adopted remote memo {} at version {}",
                    self.document_id, remote.version
                );
                Ok(Some(remote))
            }
        }
    }

    // ==================== Dispatch ====================

    /// Claim the driver role if there is work and nothing blocks it.
    fn try_begin(&self, inner: &mut Inner) -> bool {
        let has_work = inner.pending.is_some() || inner.shadow_stale;
        if inner.saving || !has_work || inner.conflict.is_some() {
            return false;
        }
        if !self.connectivity.is_online() {
            if let Some(request) = &inner.pending {
                debug!("Offline, holding seq {}", request.seq);
                inner.status = SaveStatus::Offline;
            }
            return false;
        }
        inner.saving = true;
        self.busy.send_replace(true);
        true
    }

    /// Dispatch the trailing slot until it is empty or the queue parks.
    async fn drive(&self) {
        let mut guard = DriveGuard {
            coordinator: self,
            in_flight: None,
            finished: false,
        };

        loop {
            let stale = self.lock().shadow_stale;
            if stale && !self.refresh_shadow().await {
                guard.finish();
                return;
            }

            let next = self.update(|inner| {
                if !self.connectivity.is_online() {
                    if inner.pending.is_some() {
                        inner.status = SaveStatus::Offline;
                    }
                    return None;
                }
                let request = inner.pending.take()?;
                inner.in_flight = Some(request.seq);
                inner.keep_local = false;
                if !self.client.is_unchanged(&request.hash) {
                    inner.status = SaveStatus::Saving;
                }
                Some((request, inner.shadow.version))
            });
            let Some((request, expected_version)) = next else {
                guard.finish();
                return;
            };
            guard.in_flight = Some(request.clone());

            let result = retry::run(&self.policy, |attempt| {
                let request = &request;
                async move {
                    // Connectivity can drop between attempts
                    if !self.connectivity.is_online() {
                        return Err(SaveError::Offline);
                    }
                    if attempt > 1 {
                        debug!("Retrying seq {} (attempt {})", request.seq, attempt);
                    }
                    self.client.write(request, expected_version).await
                }
            })
            .await;

            let keep_going = match result {
                Ok(outcome) => self.on_written(request, outcome),
                Err(RetryError::Rejected(SaveError::Conflict { current_version })) => {
                    self.on_conflict(request, current_version).await;
                    false
                }
                Err(RetryError::Rejected(SaveError::Offline)) => {
                    self.on_offline(request);
                    false
                }
                Err(e) => {
                    self.on_failed(request, e.to_string());
                    false
                }
            };
            // Settled: the handlers above already placed the request
            guard.in_flight = None;

            if !keep_going {
                guard.finish();
                return;
            }
        }
    }

    /// Apply a settled write. Returns whether to keep draining.
    fn on_written(&self, request: SaveRequest, outcome: WriteOutcome) -> bool {
        match outcome {
            WriteOutcome::Saved { version, .. } => {
                self.update(|inner| {
                    inner.in_flight = None;
                    inner.shadow.version = version;
                    inner.shadow.title = request.title.clone();
                    inner.shadow.content = request.content.clone();
                    inner.shadow.updated_at = Utc::now();
                    inner.status = SaveStatus::Saved { version };
                    // A newer edit's backup must survive until that edit saves
                    if inner.pending.is_none() {
                        self.backups.clear(&self.document_id);
                    }
                });
                self.announcer.announce_saved(version);
            }
            WriteOutcome::Unchanged => {
                self.update(|inner| {
                    inner.in_flight = None;
                    if inner.pending.is_none() {
                        self.backups.clear(&self.document_id);
                        inner.status = SaveStatus::Saved {
                            version: inner.shadow.version,
                        };
                    }
                });
            }
            WriteOutcome::Stale { seq } => {
                self.update(|inner| {
                    inner.in_flight = None;
                    if inner.pending.is_none() {
                        inner.status = SaveStatus::Saved {
                            version: inner.shadow.version,
                        };
                    }
                });
                self.events.emit(SaveEvent::StaleResponse { seq });
            }
        }
        true
    }

    async fn on_conflict(&self, request: SaveRequest, current_version: Option<u64>) {
        warn!(
            "Conflict saving {} seq {} against version {:?}",
            self.document_id, request.seq, current_version
        );

        let remote = match self.fetch_remote().await {
            Ok(memo) => Some(memo),
            Err(e) => {
                error!("Failed to refresh {} after conflict: {}", self.document_id, e);
                None
            }
        };

        self.update(|inner| {
            inner.in_flight = None;
            match &remote {
                Some(memo) => {
                    self.client.mark_saved(memo.hash());
                    inner.shadow = memo.clone();
                    inner.shadow_stale = false;
                }
                None => inner.shadow_stale = true,
            }
            // Kept for KeepLocal; the backup still holds it too
            if inner.pending.is_none() {
                inner.pending = Some(request);
            }
            let conflict = Conflict {
                remote_version: current_version,
                remote,
            };
            inner.status = SaveStatus::Conflict {
                remote_version: conflict.version(inner.shadow.version),
            };
            inner.conflict = Some(conflict);
        });
    }

    fn on_failed(&self, request: SaveRequest, message: String) {
        error!("Failed to save {} seq {}: {}", self.document_id, request.seq, message);
        self.update(|inner| {
            inner.in_flight = None;
            if inner.pending.is_none() {
                inner.pending = Some(request);
            }
            inner.status = if self.connectivity.is_online() {
                SaveStatus::Error { message }
            } else {
                SaveStatus::Offline
            };
        });
    }

    fn on_offline(&self, request: SaveRequest) {
        info!(
            "Connection lost while saving {} seq {}, holding it",
            self.document_id, request.seq
        );
        self.update(|inner| {
            inner.in_flight = None;
            if inner.pending.is_none() {
                inner.pending = Some(request);
            }
            inner.status = SaveStatus::Offline;
        });
    }

    /// Fetch the remote memo into the shadow before the next write.
    ///
    /// Returns `false` when nothing may be written: the fetch failed, or the
    /// remote moved past what this instance last saved while an edit made
    /// against the older content is pending. The latter is a conflict.
    async fn refresh_shadow(&self) -> bool {
        let known = self.client.last_saved();

        let memo = match self.fetch_remote().await {
            Ok(memo) => memo,
            Err(SaveError::Rejected(StoreError::NotFound(_))) => {
                debug!("Memo {} does not exist remotely yet", self.document_id);
                let shadow = self.update(|inner| {
                    inner.shadow_stale = false;
                    inner.shadow.clone()
                });
                self.events.emit(SaveEvent::ShadowRefreshed { memo: shadow });
                return true;
            }
            Err(e) => {
                warn!("Failed to refresh stale shadow of {}: {}", self.document_id, e);
                self.update(|inner| {
                    if inner.pending.is_some() {
                        inner.status = SaveStatus::Error {
                            message: e.to_string(),
                        };
                    }
                });
                return false;
            }
        };

        let remote_hash = memo.hash();
        let conflicted = self.update(|inner| {
            debug!(
                "Shadow of {} refreshed from version {} to {}",
                self.document_id, inner.shadow.version, memo.version
            );
            let moved = known.as_ref() != Some(&remote_hash);
            let overwrites = inner
                .pending
                .as_ref()
                .is_some_and(|request| request.hash != remote_hash);
            let conflicted = moved && overwrites && !inner.keep_local;

            self.client.mark_saved(remote_hash.clone());
            inner.shadow = memo.clone();
            inner.shadow_stale = false;

            if conflicted {
                inner.status = SaveStatus::Conflict {
                    remote_version: memo.version,
                };
                inner.conflict = Some(Conflict {
                    remote_version: Some(memo.version),
                    remote: Some(memo.clone()),
                });
            }
            conflicted
        });

        if conflicted {
            warn!(
                "Memo {} changed remotely (version {}) under an unsaved edit, holding it",
                self.document_id, memo.version
            );
        }
        self.events.emit(SaveEvent::ShadowRefreshed { memo });
        !conflicted
    }

    /// `SaveClient::refresh`, bounded like a single write attempt.
    async fn fetch_remote(&self) -> Result<Memo, SaveError> {
        self.client.refresh_within(self.policy.attempt_timeout).await
    }

    async fn wait_idle(&self) {
        let mut rx = self.busy.subscribe();
        // Only fails if the sender is dropped, which cannot outlive `self`
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    // ==================== State helpers ====================

    fn state_of(inner: &Inner) -> CoordinatorState {
        if inner.saving {
            CoordinatorState::Saving
        } else if inner.pending.is_some() {
            CoordinatorState::IdleWithPending
        } else {
            CoordinatorState::Idle
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate state, then publish a status change once the lock is released.
    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let (result, changed) = {
            let mut inner = self.lock();
            let before = inner.status.clone();
            let result = f(&mut inner);
            let changed = (inner.status != before).then(|| inner.status.clone());
            (result, changed)
        };

        if let Some(status) = changed {
            self.events.emit(SaveEvent::StatusChanged {
                status,
                timestamp: Utc::now().timestamp_millis(),
            });
        }
        result
    }
}

/// Releases the driver role when `drive` ends, including when its future is
/// dropped mid-write (flush deadline). A cancelled write goes back to the
/// trailing slot unless a newer edit is already there.
struct DriveGuard<'a> {
    coordinator: &'a SaveCoordinator,
    in_flight: Option<SaveRequest>,
    finished: bool,
}

impl DriveGuard<'_> {
    fn finish(&mut self) {
        self.finished = true;
        self.release();
    }

    fn release(&mut self) {
        let request = self.in_flight.take();
        let mut inner = self.coordinator.lock();
        if let Some(request) = request {
            debug!(
                "Write of {} seq {} cancelled, keeping it pending",
                self.coordinator.document_id, request.seq
            );
            if inner.pending.is_none() {
                inner.pending = Some(request);
            }
        }
        inner.in_flight = None;
        inner.saving = false;
        self.coordinator.busy.send_replace(false);
    }
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
        }
    }
}
