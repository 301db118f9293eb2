//! Crash-safe local snapshot of unsaved memo content.
//!
//! Every edit overwrites the backup for its document; a confirmed remote save
//! clears it. On attach, a surviving backup newer than the remote copy is
//! offered for restoration.
//!
//! All operations are best effort. Storage failures are logged and swallowed
//! so a full or broken store never blocks typing.

use crate::kv::KeyValueStore;
use crate::memo::Memo;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot persisted under `memo-backup:<documentId>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalBackup {
    pub content: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

pub fn backup_key(document_id: &str) -> String {
    format!("memo-backup:{}", document_id)
}

#[derive(Clone)]
pub struct BackupStore {
    kv: Arc<dyn KeyValueStore>,
}

impl BackupStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Overwrite the backup for `document_id` with the current time.
    pub fn save(&self, document_id: &str, title: &str, content: &str) {
        self.write(&LocalBackup {
            content: content.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            document_id: document_id.to_string(),
            title: Some(title.to_string()),
        });
    }

    /// Overwrite the backup with a prepared snapshot.
    pub fn write(&self, backup: &LocalBackup) {
        let json = match serde_json::to_string(backup) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize backup for {}: {}", backup.document_id, e);
                return;
            }
        };
        if let Err(e) = self.kv.set(&backup_key(&backup.document_id), &json) {
            warn!("Failed to write backup for {}: {}", backup.document_id, e);
        }
    }

    pub fn load(&self, document_id: &str) -> Option<LocalBackup> {
        let raw = match self.kv.get(&backup_key(document_id)) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read backup for {}: {}", document_id, e);
                return None;
            }
        };
        match serde_json::from_str::<LocalBackup>(&raw) {
            Ok(backup) if backup.document_id == document_id => Some(backup),
            Ok(backup) => {
                warn!(
                    "Ignoring backup under {} that belongs to {}",
                    document_id, backup.document_id
                );
                None
            }
            Err(e) => {
                warn!("Ignoring unreadable backup for {}: {}", document_id, e);
                None
            }
        }
    }

    pub fn clear(&self, document_id: &str) {
        if let Err(e) = self.kv.remove(&backup_key(document_id)) {
            warn!("Failed to clear backup for {}: {}", document_id, e);
        }
    }

    /// Backup worth offering for restoration against the remote copy.
    ///
    /// Only a backup written after the remote's last update, and holding
    /// something other than what the remote already has, qualifies.
    pub fn restorable(&self, remote: &Memo) -> Option<LocalBackup> {
        let backup = self.load(&remote.id)?;

        if backup.timestamp <= remote.updated_at.timestamp_millis() {
            debug!("Backup for {} is older than the remote copy", remote.id);
            return None;
        }

        let same_title = backup.title.as_deref().is_none_or(|t| t == remote.title);
        if same_title && backup.content == remote.content {
            debug!("Backup for {} matches the remote copy", remote.id);
            return None;
        }

        Some(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use chrono::{DateTime, TimeZone};

    fn remote(updated_at: DateTime<Utc>) -> Memo {
        Memo {
            id: "m1".into(),
            title: "Title".into(),
            content: "remote".into(),
            version: 3,
            updated_at,
        }
    }

    fn backup_at(timestamp: i64, content: &str) -> LocalBackup {
        LocalBackup {
            content: content.into(),
            timestamp,
            document_id: "m1".into(),
            title: Some("Title".into()),
        }
    }

    #[test]
    fn test_save_load_clear() {
        let store = BackupStore::new(Arc::new(MemoryKv::new()));

        store.save("m1", "Title", "draft");
        let backup = store.load("m1").unwrap();
        assert_eq!(backup.content, "draft");
        assert_eq!(backup.title.as_deref(), Some("Title"));
        assert_eq!(backup.document_id, "m1");

        store.save("m1", "Title", "draft 2");
        assert_eq!(store.load("m1").unwrap().content, "draft 2");

        store.clear("m1");
        assert!(store.load("m1").is_none());
    }

    #[test]
    fn test_backup_json_shape() {
        let kv = Arc::new(MemoryKv::new());
        let store = BackupStore::new(kv.clone());
        store.write(&backup_at(1000, "x"));

        let raw = kv.get("memo-backup:m1").unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["content"], "x");
        assert_eq!(json["timestamp"], 1000);
        assert_eq!(json["documentId"], "m1");
    }

    #[test]
    fn test_backup_without_title_parses() {
        let kv = Arc::new(MemoryKv::new());
        kv.set(
            "memo-backup:m1",
            r#"{"content":"old","timestamp":5,"documentId":"m1"}"#,
        )
        .unwrap();

        let backup = BackupStore::new(kv).load("m1").unwrap();
        assert_eq!(backup.content, "old");
        assert!(backup.title.is_none());
    }

    #[test]
    fn test_quota_failure_is_swallowed() {
        let store = BackupStore::new(Arc::new(MemoryKv::with_quota(4)));
        store.save("m1", "Title", "content far beyond quota");
        assert!(store.load("m1").is_none());
    }

    #[test]
    fn test_corrupt_backup_is_ignored() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("memo-backup:m1", "{not json").unwrap();
        assert!(BackupStore::new(kv).load("m1").is_none());
    }

    // ==================== Restoration ====================

    #[test]
    fn test_restorable_when_newer_than_remote() {
        let store = BackupStore::new(Arc::new(MemoryKv::new()));
        let updated_at = Utc.timestamp_millis_opt(10_000).unwrap();
        store.write(&backup_at(20_000, "unsaved"));

        let offer = store.restorable(&remote(updated_at)).unwrap();
        assert_eq!(offer.content, "unsaved");
    }

    #[test]
    fn test_not_restorable_when_older_than_remote() {
        let store = BackupStore::new(Arc::new(MemoryKv::new()));
        let updated_at = Utc.timestamp_millis_opt(30_000).unwrap();
        store.write(&backup_at(20_000, "unsaved"));

        assert!(store.restorable(&remote(updated_at)).is_none());
    }

    #[test]
    fn test_not_restorable_when_identical_to_remote() {
        let store = BackupStore::new(Arc::new(MemoryKv::new()));
        let updated_at = Utc.timestamp_millis_opt(10_000).unwrap();
        store.write(&backup_at(20_000, "remote"));

        assert!(store.restorable(&remote(updated_at)).is_none());
    }
}
