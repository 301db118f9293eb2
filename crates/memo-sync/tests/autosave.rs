use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use memo_sync::memo::{WriteAck, WriteRequest};
use memo_sync::{
    BackupStore, ConnectivityMonitor, CoordinatorState, EngineConfig, KeyValueStore, Memo,
    MemoStore, MemoryKv, MemoryStore, NoopLifecycle, NoopTabBus, Resolution, SaveClient,
    SaveRequest, SaveStatus, Session, SessionPorts, StoreError, WriteOutcome,
};

struct Harness {
    store: Arc<MemoryStore>,
    kv: Arc<MemoryKv>,
    connectivity: ConnectivityMonitor,
    session: Arc<Session>,
}

async fn attach(store: Arc<MemoryStore>, kv: Arc<MemoryKv>, online: bool) -> Harness {
    let connectivity = ConnectivityMonitor::new(online);
    let ports = SessionPorts {
        store: store.clone(),
        kv: kv.clone(),
        tabs: Arc::new(NoopTabBus),
        lifecycle: Arc::new(NoopLifecycle),
        connectivity: connectivity.clone(),
    };
    let session = Session::attach(&EngineConfig::default(), "m1", ports)
        .await
        .expect("attach");
    Harness {
        store,
        kv,
        connectivity,
        session: Arc::new(session),
    }
}

async fn attach_empty() -> Harness {
    attach(Arc::new(MemoryStore::new()), Arc::new(MemoryKv::new()), true).await
}

fn memo(content: &str, version: u64) -> Memo {
    Memo {
        id: "m1".into(),
        title: "Groceries".into(),
        content: content.into(),
        version,
        updated_at: Utc::now(),
    }
}

fn has_backup(kv: &MemoryKv) -> bool {
    kv.get("memo-backup:m1").unwrap().is_some()
}

// ==================== Idempotence ====================

#[tokio::test]
async fn same_content_twice_writes_once() {
    let h = attach_empty().await;

    h.session.edit("Groceries", "milk").await;
    h.session.edit("Groceries", "milk").await;

    assert_eq!(h.store.write_count(), 1);
    assert_eq!(h.session.status(), SaveStatus::Saved { version: 1 });
    assert!(!has_backup(&h.kv));
}

#[tokio::test]
async fn title_change_alone_is_saved() {
    let h = attach_empty().await;

    h.session.edit("Groceries", "milk").await;
    h.session.edit("Shopping", "milk").await;

    assert_eq!(h.store.write_count(), 2);
    assert_eq!(h.store.get("m1").unwrap().title, "Shopping");
}

// ==================== Coalescing ====================

#[tokio::test(start_paused = true)]
async fn rapid_edits_during_inflight_write_coalesce() {
    let h = attach_empty().await;
    h.store.set_write_delay(Some(Duration::from_millis(500)));

    let first = {
        let session = h.session.clone();
        tokio::spawn(async move { session.edit("Groceries", "v0").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.session.snapshot().state, CoordinatorState::Saving);

    for i in 1..=5 {
        h.session.edit("Groceries", &format!("v{i}")).await;
    }
    assert_eq!(h.session.snapshot().pending_seq, Some(6));

    first.await.unwrap();

    let writes = h.store.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].content, "v0");
    assert_eq!(writes[1].content, "v5");
    assert_eq!(writes[1].version, 1);
    assert_eq!(h.store.get("m1").unwrap().content, "v5");
    assert_eq!(h.session.snapshot().state, CoordinatorState::Idle);
    assert!(!has_backup(&h.kv));
}

// ==================== Stale responses ====================

/// Answers seq 1 slowly and seq 2 quickly.
struct SlowFirstStore;

#[async_trait]
impl MemoStore for SlowFirstStore {
    async fn write(&self, _document_id: &str, request: &WriteRequest) -> memo_sync::store::Result<WriteAck> {
        let delay = if request.seq == 1 { 300 } else { 10 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(WriteAck {
            version: request.seq + 1,
            seq: request.seq,
        })
    }

    async fn fetch(&self, document_id: &str) -> memo_sync::store::Result<Memo> {
        Err(StoreError::NotFound(document_id.to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn older_response_arriving_last_is_discarded() {
    let client = SaveClient::new(Arc::new(SlowFirstStore), "m1");
    let one = SaveRequest::new("Groceries", "first", 1);
    let two = SaveRequest::new("Groceries", "second", 2);

    let (r1, r2) = tokio::join!(client.write(&one, 0), client.write(&two, 0));

    assert_eq!(r2.unwrap(), WriteOutcome::Saved { version: 3, seq: 2 });
    assert_eq!(r1.unwrap(), WriteOutcome::Stale { seq: 1 });
    // Dedup state reflects seq 2, so re-sending it is free
    assert!(client.is_unchanged(&two.hash));
    assert!(!client.is_unchanged(&one.hash));
}

/// Acknowledges the third write with the first write's ack, the way a
/// replaying proxy would.
#[derive(Default)]
struct ReplayingStore {
    acks: std::sync::Mutex<Vec<WriteAck>>,
}

#[async_trait]
impl MemoStore for ReplayingStore {
    async fn write(&self, _document_id: &str, request: &WriteRequest) -> memo_sync::store::Result<WriteAck> {
        let mut acks = self.acks.lock().unwrap();
        let ack = if acks.len() == 2 {
            acks[0].clone()
        } else {
            WriteAck {
                version: acks.len() as u64 + 1,
                seq: request.seq,
            }
        };
        acks.push(ack.clone());
        Ok(ack)
    }

    async fn fetch(&self, document_id: &str) -> memo_sync::store::Result<Memo> {
        Err(StoreError::NotFound(document_id.to_string()))
    }
}

#[tokio::test]
async fn stale_ack_settles_status() {
    let session = Session::attach(
        &EngineConfig::default(),
        "m1",
        SessionPorts {
            store: Arc::new(ReplayingStore::default()),
            kv: Arc::new(MemoryKv::new()),
            tabs: Arc::new(NoopTabBus),
            lifecycle: Arc::new(NoopLifecycle),
            connectivity: ConnectivityMonitor::new(true),
        },
    )
    .await
    .expect("attach");

    let stale = Arc::new(std::sync::Mutex::new(Vec::new()));
    let _sub = session.subscribe({
        let stale = stale.clone();
        move |event| {
            if let memo_sync::SaveEvent::StaleResponse { seq } = event {
                stale.lock().unwrap().push(seq);
            }
        }
    });

    session.edit("Groceries", "milk").await;
    session.edit("Groceries", "milk, eggs").await;
    session.edit("Groceries", "milk, eggs, bread").await;

    assert_eq!(*stale.lock().unwrap(), vec![1]);
    // Not stuck on Saving: the shadow's version is the last one confirmed
    assert_eq!(session.status(), SaveStatus::Saved { version: 2 });
    assert_eq!(session.snapshot().state, CoordinatorState::Idle);
}

// ==================== Conflicts ====================

async fn conflicted() -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.put(memo("milk", 1));
    let h = attach(store, Arc::new(MemoryKv::new()), true).await;

    // Another device writes version 2 behind our back
    h.store.put(memo("milk, bread", 2));
    h.session.edit("Groceries", "milk, eggs").await;
    h
}

#[tokio::test(start_paused = true)]
async fn conflict_refreshes_once_and_never_retries() {
    let h = conflicted().await;

    // One fetch on attach, one after the conflict
    assert_eq!(h.store.fetch_count(), 2);
    assert_eq!(h.store.write_count(), 1);
    assert_eq!(h.session.status(), SaveStatus::Conflict { remote_version: 2 });

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.state, CoordinatorState::IdleWithPending);
    assert_eq!(snapshot.shadow_version, 2);
    let conflict = snapshot.conflict.unwrap();
    assert_eq!(conflict.remote.unwrap().content, "milk, bread");
    assert!(has_backup(&h.kv));

    // Time passing and reconnects do not re-send
    tokio::time::sleep(Duration::from_secs(30)).await;
    h.session.coordinator().resume().await;
    assert_eq!(h.store.write_count(), 1);
    assert_eq!(h.store.get("m1").unwrap().content, "milk, bread");
}

#[tokio::test]
async fn keep_local_writes_against_refreshed_version() {
    let h = conflicted().await;

    let remote = h.session.resolve_conflict(Resolution::KeepLocal).await.unwrap();
    assert_eq!(remote, None);

    let stored = h.store.get("m1").unwrap();
    assert_eq!(stored.content, "milk, eggs");
    assert_eq!(stored.version, 3);
    assert_eq!(h.store.writes()[1].version, 2);
    assert_eq!(h.session.status(), SaveStatus::Saved { version: 3 });
    assert!(!has_backup(&h.kv));
}

#[tokio::test]
async fn accept_remote_discards_local() {
    let h = conflicted().await;

    let remote = h.session.resolve_conflict(Resolution::AcceptRemote).await.unwrap();
    assert_eq!(remote.unwrap().content, "milk, bread");

    assert_eq!(h.store.write_count(), 1);
    assert_eq!(h.session.status(), SaveStatus::Saved { version: 2 });
    assert_eq!(h.session.snapshot().pending_seq, None);
    assert!(!has_backup(&h.kv));
    assert_eq!(h.session.editor().get().unwrap().content, "milk, bread");
}

#[tokio::test]
async fn typing_after_conflict_writes_on_top() {
    let h = conflicted().await;

    h.session.edit("Groceries", "milk, bread, eggs").await;

    let stored = h.store.get("m1").unwrap();
    assert_eq!(stored.content, "milk, bread, eggs");
    assert_eq!(stored.version, 3);
    assert_eq!(h.session.snapshot().conflict, None);
}

// ==================== Backoff ====================

#[tokio::test(start_paused = true)]
async fn three_transient_failures_end_in_error() {
    let h = attach_empty().await;
    for _ in 0..3 {
        h.store.fail_next_write(StoreError::Status(503, "unavailable".into()));
    }

    let started = tokio::time::Instant::now();
    h.session.edit("Groceries", "milk").await;
    let elapsed = started.elapsed();

    assert_eq!(h.store.write_count(), 3);
    assert!(matches!(h.session.status(), SaveStatus::Error { .. }));
    // 1s then 2s of backoff between the three attempts
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(4));

    // No background retry after giving up
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.store.write_count(), 3);
    assert_eq!(h.session.snapshot().pending_seq, Some(1));
    assert!(has_backup(&h.kv));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_then_success() {
    let h = attach_empty().await;
    h.store.fail_next_write(StoreError::Timeout);

    h.session.edit("Groceries", "milk").await;

    assert_eq!(h.store.write_count(), 2);
    assert_eq!(h.session.status(), SaveStatus::Saved { version: 1 });
}

// ==================== Crash recovery ====================

#[tokio::test]
async fn newer_backup_is_offered() {
    let store = Arc::new(MemoryStore::new());
    let mut remote = memo("milk", 1);
    remote.updated_at = Utc::now() - chrono::Duration::hours(1);
    store.put(remote);

    let kv = Arc::new(MemoryKv::new());
    BackupStore::new(kv.clone()).save("m1", "Groceries", "milk, unsaved");

    let h = attach(store, kv, true).await;
    let offer = h.session.restore_offer().unwrap();
    assert_eq!(offer.backup.content, "milk, unsaved");

    h.session.discard_restore();
    assert!(!has_backup(&h.kv));
    assert_eq!(h.session.restore_offer(), None);
}

#[tokio::test]
async fn older_backup_is_not_offered() {
    let kv = Arc::new(MemoryKv::new());
    BackupStore::new(kv.clone()).save("m1", "Groceries", "stale draft");

    let store = Arc::new(MemoryStore::new());
    let mut remote = memo("milk", 4);
    remote.updated_at = Utc::now() + chrono::Duration::hours(1);
    store.put(remote);

    let h = attach(store, kv, true).await;
    assert_eq!(h.session.restore_offer(), None);
}

// ==================== Offline ====================

#[tokio::test]
async fn offline_edits_send_one_write_on_reconnect() {
    let h = attach(Arc::new(MemoryStore::new()), Arc::new(MemoryKv::new()), false).await;

    h.session.edit("Groceries", "m").await;
    h.session.edit("Groceries", "mi").await;
    h.session.edit("Groceries", "milk").await;

    assert_eq!(h.store.write_count(), 0);
    assert_eq!(h.session.status(), SaveStatus::Offline);
    assert!(has_backup(&h.kv));

    h.connectivity.set_online(true);
    h.session.coordinator().resume().await;

    let writes = h.store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].content, "milk");
    assert_eq!(h.session.status(), SaveStatus::Saved { version: 1 });
}

#[tokio::test]
async fn run_loop_resumes_on_reconnect() {
    let h = attach(Arc::new(MemoryStore::new()), Arc::new(MemoryKv::new()), false).await;
    h.session.edit("Groceries", "milk").await;

    let (saved_tx, saved_rx) = tokio::sync::oneshot::channel();
    let saved_tx = std::sync::Mutex::new(Some(saved_tx));
    let _sub = h.session.subscribe(move |event| {
        if let memo_sync::SaveEvent::StatusChanged {
            status: SaveStatus::Saved { .. },
            ..
        } = event
        {
            if let Some(tx) = saved_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    });

    let session = h.session.clone();
    let run = tokio::spawn(async move {
        session
            .run(async {
                saved_rx.await.ok();
            })
            .await
    });

    tokio::task::yield_now().await;
    h.connectivity.set_online(true);

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run loop finished")
        .unwrap()
        .unwrap();
    assert_eq!(h.store.get("m1").unwrap().content, "milk");
}
