//! File watcher with debouncing for the memo file.
//!
//! Uses notify-debouncer-mini for efficient file change detection. The
//! parent directory is watched rather than the file itself, because most
//! editors save by writing a temporary file and renaming it over the
//! original, which would silently detach a watch on the file's inode.

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Type of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Watches a single file.
pub struct FileWatcher {
    path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEventKind>,
}

/// Last seen mtime, to filter spurious events (Docker volume bug workaround)
type LastMtime = Arc<Mutex<Option<SystemTime>>>;

impl FileWatcher {
    /// Create a new watcher for `path`. The file itself need not exist yet,
    /// but its directory must.
    ///
    /// Uses 200ms debounce period to avoid rapid-fire events during saves.
    pub fn new(path: PathBuf) -> Result<Self> {
        let file_name = path
            .file_name()
            .with_context(|| format!("{:?} has no file name", path))?
            .to_owned();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        // Canonicalize the directory to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Directory of {:?} does not exist", path))?;
        let path = dir.join(&file_name);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watched = path.clone();
        let last_mtime: LastMtime = Arc::new(Mutex::new(None));

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    // Several events for our file in one batch are one change
                    if !events.iter().any(|event| event.path == watched) {
                        return;
                    }
                    if let Some(kind) = Self::classify(&watched, &last_mtime) {
                        // Receiver dropped means we are shutting down
                        let _ = event_tx.send(kind);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Turn a change notification into an event, or `None` if spurious.
    fn classify(path: &Path, last_mtime: &LastMtime) -> Option<FileEventKind> {
        let mut last = last_mtime.lock().unwrap_or_else(|e| e.into_inner());

        let Ok(metadata) = std::fs::metadata(path) else {
            *last = None;
            debug!("File event: Deleted - {:?}", path);
            return Some(FileEventKind::Deleted);
        };

        if let Ok(mtime) = metadata.modified() {
            if *last == Some(mtime) {
                // Mtime unchanged - spurious event, skip it
                return None;
            }
            *last = Some(mtime);
        }

        debug!("File event: Modified - {:?}", path);
        Some(FileEventKind::Modified)
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEventKind> {
        &mut self.event_rx
    }

    /// Canonical path of the watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
