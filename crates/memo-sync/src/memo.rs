//! Memo document and the requests that carry it to the remote store.

use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A memo as stored remotely.
///
/// The engine keeps one of these as its *shadow*: its belief about the
/// remote version, used for optimistic-concurrency checks only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memo {
    /// Document id. Absent in some store responses; filled in from the URL.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub version: u64,
    /// Last modification time on the remote store.
    #[serde(default, alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Memo {
    /// An empty shadow for a document the engine has not fetched yet.
    pub fn unfetched(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            content: String::new(),
            version: 0,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn hash(&self) -> ContentHash {
        ContentHash::of_memo(&self.title, &self.content)
    }
}

/// One edit waiting to be written.
///
/// Created on every edit and overwritten by the next one until dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub title: String,
    pub content: String,
    /// Opaque id sent to the store for request tracing.
    pub request_id: Uuid,
    /// Monotonically increasing per coordinator. Orders responses.
    pub seq: u64,
    pub hash: ContentHash,
}

impl SaveRequest {
    pub fn new(title: impl Into<String>, content: impl Into<String>, seq: u64) -> Self {
        let title = title.into();
        let content = content.into();
        let hash = ContentHash::of_memo(&title, &content);
        Self {
            title,
            content,
            request_id: Uuid::new_v4(),
            seq,
            hash,
        }
    }

    /// Build the wire body for a write against `version`.
    pub fn to_write(&self, version: u64) -> WriteRequest {
        WriteRequest {
            title: self.title.clone(),
            content: self.content.clone(),
            version,
            request_id: self.request_id,
            seq: self.seq,
        }
    }
}

/// Body of `PUT /memos/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub title: String,
    pub content: String,
    /// Version the writer believes is current.
    pub version: u64,
    pub request_id: Uuid,
    pub seq: u64,
}

/// Successful write acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// Version assigned by the store to the written memo.
    pub version: u64,
    /// Seq echoed back by the store.
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_request_hash_matches_content() {
        let request = SaveRequest::new("Title", "Body", 3);
        assert_eq!(request.hash, ContentHash::of_memo("Title", "Body"));
        assert_eq!(request.seq, 3);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = SaveRequest::new("t", "c", 1);
        let b = SaveRequest::new("t", "c", 1);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_write_request_serialization() {
        let request = SaveRequest::new("Title", "Body", 7);
        let json = serde_json::to_value(request.to_write(4)).unwrap();

        assert_eq!(json["title"], "Title");
        assert_eq!(json["content"], "Body");
        assert_eq!(json["version"], 4);
        assert_eq!(json["seq"], 7);
        assert_eq!(json["requestId"], request.request_id.to_string());
    }

    #[test]
    fn test_memo_parses_store_response() {
        let json = r#"{
            "title": "Week 3",
            "content": "notes",
            "version": 12,
            "updated_at": "2026-03-01T10:00:00Z"
        }"#;
        let memo: Memo = serde_json::from_str(json).unwrap();

        assert_eq!(memo.id, "");
        assert_eq!(memo.version, 12);
        assert_eq!(memo.updated_at.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_unfetched_memo_starts_at_version_zero() {
        let memo = Memo::unfetched("m1");
        assert_eq!(memo.version, 0);
        assert_eq!(memo.updated_at, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(memo.hash(), ContentHash::of_memo("", ""));
    }
}
