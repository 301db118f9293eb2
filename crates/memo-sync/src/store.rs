//! MemoStore trait for the remote document store.
//!
//! Implementations:
//! - `HttpMemoStore` (in `http`) - `PUT`/`GET /memos/{id}` over HTTP
//! - `MemoryStore` - In-process store with the same version check, for tests
//!
//! The store enforces optimistic concurrency: a write carries the version the
//! writer believes is current and is rejected with `Conflict` otherwise.

use crate::memo::{Memo, WriteAck, WriteRequest};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Version conflict (remote at {current_version:?})")]
    Conflict { current_version: Option<u64> },

    #[error("Memo not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("HTTP status {0}: {1}")]
    Status(u16, String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Failures that may succeed when repeated unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Network(_) | StoreError::Timeout => true,
            StoreError::Status(code, _) => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Remote memo store.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait MemoStore: Send + Sync {
    /// Versioned write of a memo.
    async fn write(&self, document_id: &str, request: &WriteRequest) -> Result<WriteAck>;

    /// Authoritative current memo.
    async fn fetch(&self, document_id: &str) -> Result<Memo>;
}

/// In-memory store for testing.
///
/// Records every write it receives and can be scripted to fail or stall.
#[derive(Default)]
pub struct MemoryStore {
    memos: Mutex<HashMap<String, Memo>>,
    writes: Mutex<Vec<WriteRequest>>,
    failures: Mutex<VecDeque<StoreError>>,
    write_delay: Mutex<Option<Duration>>,
    fetch_delay: Mutex<Option<Duration>>,
    fetch_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a memo, as another client would.
    pub fn put(&self, memo: Memo) {
        let mut memos = self.memos.lock().unwrap_or_else(|e| e.into_inner());
        memos.insert(memo.id.clone(), memo);
    }

    pub fn get(&self, document_id: &str) -> Option<Memo> {
        let memos = self.memos.lock().unwrap_or_else(|e| e.into_inner());
        memos.get(document_id).cloned()
    }

    /// Fail the next write with `error` (queued, one per write).
    pub fn fail_next_write(&self, error: StoreError) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.push_back(error);
    }

    /// Delay every write by `delay` before it is applied.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Delay every fetch by `delay`, e.g. to stand in for a hung server.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Every write received, in arrival order (including failed ones).
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn apply(&self, document_id: &str, request: &WriteRequest) -> Result<WriteAck> {
        let mut memos = self.memos.lock().unwrap_or_else(|e| e.into_inner());
        let current_version = memos.get(document_id).map(|m| m.version).unwrap_or(0);
        if request.version != current_version {
            return Err(StoreError::Conflict {
                current_version: Some(current_version),
            });
        }

        let version = current_version + 1;
        memos.insert(
            document_id.to_string(),
            Memo {
                id: document_id.to_string(),
                title: request.title.clone(),
                content: request.content.clone(),
                version,
                updated_at: Utc::now(),
            },
        );
        Ok(WriteAck {
            version,
            seq: request.seq,
        })
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl MemoStore for MemoryStore {
    async fn write(&self, document_id: &str, request: &WriteRequest) -> Result<WriteAck> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let delay = *self.write_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        self.apply(document_id, request)
    }

    async fn fetch(&self, document_id: &str) -> Result<Memo> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.get(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))
    }
}

// Share one store between several engines (tabs) in tests
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<T: MemoStore + ?Sized> MemoStore for std::sync::Arc<T> {
    async fn write(&self, document_id: &str, request: &WriteRequest) -> Result<WriteAck> {
        (**self).write(document_id, request).await
    }

    async fn fetch(&self, document_id: &str) -> Result<Memo> {
        (**self).fetch(document_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memo::SaveRequest;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Network("reset".into()).is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(StoreError::Status(503, "unavailable".into()).is_transient());
        assert!(StoreError::Status(429, "slow down".into()).is_transient());
        assert!(!StoreError::Status(400, "bad".into()).is_transient());
        assert!(!StoreError::Conflict { current_version: None }.is_transient());
        assert!(!StoreError::Unauthorized.is_transient());
    }

    #[tokio::test]
    async fn test_memory_store_versioned_writes() {
        let store = MemoryStore::new();

        let first = SaveRequest::new("T", "one", 1).to_write(0);
        let ack = store.write("m1", &first).await.unwrap();
        assert_eq!(ack, WriteAck { version: 1, seq: 1 });

        let second = SaveRequest::new("T", "two", 2).to_write(1);
        let ack = store.write("m1", &second).await.unwrap();
        assert_eq!(ack.version, 2);

        let memo = store.fetch("m1").await.unwrap();
        assert_eq!(memo.content, "two");
        assert_eq!(memo.version, 2);
        assert_eq!(store.fetch_count(), 1);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_stale_version() {
        let store = MemoryStore::new();
        store
            .write("m1", &SaveRequest::new("T", "one", 1).to_write(0))
            .await
            .unwrap();

        let stale = SaveRequest::new("T", "stale", 2).to_write(0);
        let err = store.write("m1", &stale).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                current_version: Some(1)
            }
        );
        assert_eq!(store.get("m1").unwrap().content, "one");
    }

    #[tokio::test]
    async fn test_memory_store_scripted_failure() {
        let store = MemoryStore::new();
        store.fail_next_write(StoreError::Timeout);

        let request = SaveRequest::new("T", "one", 1).to_write(0);
        assert_eq!(store.write("m1", &request).await, Err(StoreError::Timeout));
        assert!(store.write("m1", &request).await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_missing_memo() {
        let store = MemoryStore::new();
        assert_eq!(
            store.fetch("nope").await,
            Err(StoreError::NotFound("nope".into()))
        );
    }
}
