//! memo-autosave: Autosave a local file into a remote memo.
//!
//! Watches a file and saves every change through the memo-sync engine, with
//! local backups, retries and conflict detection.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use memo_autosave::{FileEventKind, FileWatcher, MemoFile};
use memo_sync::{
    ConnectivityMonitor, EngineConfig, FileKv, HttpMemoStore, LifecycleEvent, LocalLifecycle,
    NoopTabBus, Resolution, SaveEvent, SaveStatus, Session, SessionPorts,
};

#[derive(Parser, Debug)]
#[command(name = "memo-autosave")]
#[command(about = "Autosave a local file into a remote memo")]
struct Args {
    /// Base URL of the memo service (overrides server_url in config.json)
    #[arg(short, long)]
    server: Option<String>,

    /// Id of the memo to save into
    #[arg(short, long)]
    memo: String,

    /// File holding the memo content
    #[arg(short, long)]
    file: PathBuf,

    /// Bearer token for the memo service
    #[arg(long, env = "MEMO_AUTOSAVE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Directory holding config.json (created with defaults if missing)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for crash-recovery backups
    #[arg(long, default_value = ".memo-autosave")]
    backup_dir: PathBuf,

    /// Memo title (defaults to the remote title, then the file name)
    #[arg(long)]
    title: Option<String>,

    /// What to do when the memo changed remotely
    #[arg(long, value_enum, default_value_t = ConflictPolicy::Wait)]
    on_conflict: ConflictPolicy,

    /// Restore unsaved changes left by a previous run
    #[arg(long)]
    restore: bool,

    /// Seconds between retries after a failed save
    #[arg(long, default_value_t = 30)]
    retry_interval: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConflictPolicy {
    /// Keep the local file and overwrite the remote on the next edit
    Wait,
    /// Overwrite the remote with the local file right away
    KeepLocal,
    /// Replace the local file with the remote memo
    AcceptRemote,
}

/// Autosave state holding all components.
struct Autosave {
    session: Arc<Session>,
    file: MemoFile,
    on_conflict: ConflictPolicy,
}

impl Autosave {
    /// Bring the file and the remote memo in line after attaching.
    async fn start(&self, restore: bool) -> Result<()> {
        if let Some(offer) = self.session.restore_offer() {
            if restore {
                if let Some(backup) = self.session.accept_restore().await {
                    self.file.write(&backup.content)?;
                    info!("Restored unsaved changes from backup into {:?}", self.file.path());
                }
                return Ok(());
            }
            warn!(
                "Found unsaved changes from a previous run (backup at {}). Rerun with --restore to recover them",
                offer.backup.timestamp
            );
        }

        let shadow = self.session.shadow();
        match self.file.read()? {
            None => {
                self.file.write(&shadow.content)?;
                info!("Created {:?} from memo version {}", self.file.path(), shadow.version);
            }
            Some(content) if content != shadow.content => {
                info!("{:?} differs from the remote memo, saving", self.file.path());
                self.session.edit(self.file.title(), &content).await;
            }
            Some(_) => debug!("{:?} is up to date", self.file.path()),
        }
        Ok(())
    }

    /// Handle a file change event from the watcher.
    fn on_file_changed(&self, kind: FileEventKind) {
        match kind {
            FileEventKind::Modified => match self.file.read() {
                Ok(Some(content)) => {
                    // Staged here so reads keep their order; only the save runs in the background
                    self.session.record_edit(self.file.title(), &content);
                    let coordinator = self.session.coordinator().clone();
                    tokio::spawn(async move { coordinator.resume().await });
                }
                Ok(None) => debug!("{:?} vanished before it could be read", self.file.path()),
                Err(e) => error!("{:#}", e),
            },
            FileEventKind::Deleted => {
                warn!(
                    "{:?} was deleted; the remote memo is left untouched",
                    self.file.path()
                );
            }
        }
    }

    /// Handle a save status change.
    async fn on_status(&self, status: SaveStatus) {
        match status {
            SaveStatus::Conflict { remote_version } => match self.on_conflict {
                ConflictPolicy::Wait => warn!(
                    "Memo {} changed remotely (version {}). Your next edit will overwrite it",
                    self.session.document_id(),
                    remote_version
                ),
                ConflictPolicy::KeepLocal => {
                    info!("Memo changed remotely, keeping local content");
                    let session = self.session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session.resolve_conflict(Resolution::KeepLocal).await {
                            error!("Failed to resolve conflict: {}", e);
                        }
                    });
                }
                ConflictPolicy::AcceptRemote => {
                    match self.session.resolve_conflict(Resolution::AcceptRemote).await {
                        Ok(Some(remote)) => match self.file.write(&remote.content) {
                            Ok(()) => info!(
                                "Replaced {:?} with remote version {}",
                                self.file.path(),
                                remote.version
                            ),
                            Err(e) => error!("{:#}", e),
                        },
                        Ok(None) => {}
                        Err(e) => error!("Failed to fetch remote memo: {}", e),
                    }
                }
            },
            SaveStatus::Error { message } => {
                warn!("Save failed ({}), will retry", message);
            }
            SaveStatus::Offline => info!("Offline, changes are kept locally"),
            other => debug!("Save status: {:?}", other),
        }
    }

    /// Periodic retry after a failed save.
    fn on_retry_tick(&self) {
        if matches!(self.session.status(), SaveStatus::Error { .. }) {
            let session = self.session.clone();
            tokio::spawn(async move { session.coordinator().resume().await });
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,memo_sync=debug,memo_autosave=debug"
    } else {
        "info,memo_sync=info,memo_autosave=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting memo-autosave");

    let mut config = match &args.config {
        Some(dir) => EngineConfig::load(dir)?,
        None => EngineConfig::default(),
    };
    if let Some(server) = args.server {
        config.server_url = Some(server);
    }
    let server_url = config
        .server_url
        .clone()
        .context("No server URL: pass --server or set server_url in config.json")?;
    info!("Memo {} at {}", args.memo, server_url);
    info!("File: {:?}", args.file);

    let mut store = HttpMemoStore::new(&server_url, config.request_timeout())
        .context("Invalid server URL")?;
    if let Some(token) = args.token {
        store = store.with_bearer_token(token);
    }
    let kv = FileKv::new(args.backup_dir.clone())
        .with_context(|| format!("Failed to open backup directory {:?}", args.backup_dir))?;

    let lifecycle = Arc::new(LocalLifecycle::new());
    let ports = SessionPorts {
        store: Arc::new(store),
        kv: Arc::new(kv),
        tabs: Arc::new(NoopTabBus),
        lifecycle: lifecycle.clone(),
        connectivity: ConnectivityMonitor::new(true),
    };
    let session = Arc::new(Session::attach(&config, &args.memo, ports).await?);

    let title = args
        .title
        .or_else(|| Some(session.shadow().title).filter(|t| !t.is_empty()));
    let autosave = Autosave {
        session: session.clone(),
        file: MemoFile::new(args.file.clone(), title),
        on_conflict: args.on_conflict,
    };

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let _subscription = session.subscribe(move |event| {
        if let SaveEvent::StatusChanged { status, .. } = event {
            let _ = status_tx.send(status);
        }
    });

    autosave.start(args.restore).await?;

    let mut watcher = FileWatcher::new(args.file.clone())?;
    info!("File watcher started");

    // The session loop ends on Unload, after its bounded flush
    let run = tokio::spawn({
        let session = session.clone();
        async move { session.run(futures::future::pending()).await }
    });

    let mut retry_tick = tokio::time::interval(Duration::from_secs(args.retry_interval.max(1)));
    retry_tick.tick().await;

    info!("Autosave running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            Some(kind) = watcher.event_rx().recv() => {
                autosave.on_file_changed(kind);
            }

            Some(status) = status_rx.recv() => {
                autosave.on_status(status).await;
            }

            _ = retry_tick.tick() => {
                autosave.on_retry_tick();
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                lifecycle.fire(LifecycleEvent::Unload);
                break;
            }
        }
    }

    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Session loop failed: {}", e),
        Err(e) => error!("Session loop panicked: {}", e),
    }

    // Catch edits that arrived after the unload flush
    if !session.detach().await {
        warn!(
            "Unsaved changes remain in {:?}; they will be offered on next start",
            args.backup_dir
        );
    }

    info!("Shutting down");
    Ok(())
}
