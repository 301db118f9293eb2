//! memo-sync: Autosave engine for a single memo edited in one or more tabs.
//!
//! This crate provides the core functionality for:
//! - Coalescing edits into a single in-flight versioned write
//! - Retrying transient failures with bounded backoff
//! - Rejecting stale responses and surfacing version conflicts
//! - Local backups that survive crashes, offered back on the next attach
//! - Cross-tab, connectivity and lifecycle signals as trait-based ports

pub mod backup;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod events;
pub mod hash;
pub mod http;
pub mod kv;
pub mod lifecycle;
pub mod memo;
pub mod retry;
pub mod session;
pub mod store;
pub mod tab;

pub use backup::{BackupStore, LocalBackup};
pub use client::{SaveClient, SaveError, WriteOutcome};
pub use config::{ConfigError, EngineConfig};
pub use connectivity::ConnectivityMonitor;
pub use coordinator::{CoordinatorSnapshot, CoordinatorState, Resolution, SaveCoordinator};
pub use events::{EventBus, SaveEvent, SaveStatus, Subscription};
pub use hash::ContentHash;
pub use http::HttpMemoStore;
pub use kv::{FileKv, KeyValueStore, KvError, MemoryKv};
pub use lifecycle::{EditorRef, LifecycleEvent, LifecycleSignal, LocalLifecycle, NoopLifecycle};
pub use memo::{Memo, SaveRequest};
pub use retry::RetryPolicy;
pub use session::{RestoreOffer, Session, SessionError, SessionPorts};
pub use store::{MemoStore, MemoryStore, StoreError};
pub use tab::{LocalTabBus, NoopTabBus, TabBus, TabMessage};
