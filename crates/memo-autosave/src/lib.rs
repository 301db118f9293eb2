//! memo-autosave library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the binary's components,
//! allowing integration tests to access internal types.

pub mod memo_file;
pub mod watcher;

pub use memo_file::MemoFile;
pub use watcher::{FileEventKind, FileWatcher};
