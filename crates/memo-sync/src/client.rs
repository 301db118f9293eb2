//! Remote save client: one versioned write, classified.
//!
//! Sits between the coordinator and the `MemoStore`, adding two guards:
//! - Dedup: a request whose fingerprint equals the last acknowledged save is
//!   reported `Unchanged` without touching the network.
//! - Ordering: an acknowledgement whose seq is below the highest seq already
//!   acknowledged belongs to a superseded edit and is reported `Stale`.

use crate::hash::ContentHash;
use crate::memo::{Memo, SaveRequest};
use crate::retry::Retryable;
use crate::store::{MemoStore, StoreError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    /// The remote advanced past the expected version. Never retried blindly.
    #[error("Remote memo changed (remote at {current_version:?})")]
    Conflict { current_version: Option<u64> },

    /// Network failure, timeout or server error. Eligible for retry.
    #[error("Transient failure: {0}")]
    Transient(StoreError),

    /// The store refused the request outright.
    #[error("Save rejected: {0}")]
    Rejected(StoreError),

    /// Connectivity dropped before the attempt. The request waits for the
    /// connection instead of spending retries.
    #[error("Offline")]
    Offline,
}

impl From<StoreError> for SaveError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { current_version } => SaveError::Conflict { current_version },
            e if e.is_transient() => SaveError::Transient(e),
            e => SaveError::Rejected(e),
        }
    }
}

impl Retryable for SaveError {
    fn is_retryable(&self) -> bool {
        matches!(self, SaveError::Transient(_))
    }
}

/// Result of a write that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The store accepted the write.
    Saved { version: u64, seq: u64 },
    /// Content matches the last acknowledged save; nothing was sent.
    Unchanged,
    /// Acknowledged, but a later edit was acknowledged first. Must be ignored.
    Stale { seq: u64 },
}

#[derive(Debug, Default)]
struct ClientState {
    last_saved: Option<ContentHash>,
    highest_acked_seq: u64,
}

pub struct SaveClient {
    store: Arc<dyn MemoStore>,
    document_id: String,
    state: Mutex<ClientState>,
}

impl SaveClient {
    pub fn new(store: Arc<dyn MemoStore>, document_id: impl Into<String>) -> Self {
        Self {
            store,
            document_id: document_id.into(),
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Record `hash` as the content the remote is known to hold.
    pub fn mark_saved(&self, hash: ContentHash) {
        self.lock().last_saved = Some(hash);
    }

    pub fn last_saved(&self) -> Option<ContentHash> {
        self.lock().last_saved.clone()
    }

    pub fn is_unchanged(&self, hash: &ContentHash) -> bool {
        self.lock().last_saved.as_ref() == Some(hash)
    }

    /// Write `request` against `expected_version`.
    pub async fn write(
        &self,
        request: &SaveRequest,
        expected_version: u64,
    ) -> Result<WriteOutcome, SaveError> {
        if self.is_unchanged(&request.hash) {
            debug!(
                "Skipping write of {} seq {} (content {} already saved)",
                self.document_id, request.seq, request.hash
            );
            return Ok(WriteOutcome::Unchanged);
        }

        let ack = self
            .store
            .write(&self.document_id, &request.to_write(expected_version))
            .await?;

        let mut state = self.lock();
        if ack.seq < state.highest_acked_seq {
            debug!(
                "Discarding stale response for {} seq {} (already at seq {})",
                self.document_id, ack.seq, state.highest_acked_seq
            );
            return Ok(WriteOutcome::Stale { seq: ack.seq });
        }
        state.highest_acked_seq = ack.seq;
        state.last_saved = Some(request.hash.clone());
        info!(
            "Saved memo {} at version {} (seq {})",
            self.document_id, ack.version, ack.seq
        );

        Ok(WriteOutcome::Saved {
            version: ack.version,
            seq: ack.seq,
        })
    }

    /// Fetch the authoritative memo.
    pub async fn refresh(&self) -> Result<Memo, SaveError> {
        let memo = self.store.fetch(&self.document_id).await?;
        debug!("Refreshed memo {} at version {}", self.document_id, memo.version);
        Ok(memo)
    }

    /// `refresh`, giving up after `limit`. A timeout is transient.
    pub async fn refresh_within(&self, limit: Duration) -> Result<Memo, SaveError> {
        match tokio::time::timeout(limit, self.refresh()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Fetching memo {} timed out after {:?}", self.document_id, limit);
                Err(SaveError::Transient(StoreError::Timeout))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
