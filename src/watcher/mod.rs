//! File system watching module
//!
//! The watcher runs in its own task and is the only producer on the event
//! queue; the orchestrator is the only consumer.

mod inotify_watcher;

pub use inotify_watcher::InotifyWatcher;

use crate::audit::AuditEventType;
use crate::config::Settings;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Type of file system event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// File was created (or moved into the tree)
    Created,
    /// File was deleted (or moved out of the tree)
    Deleted,
    /// File was closed after writing
    Modified,
    /// File was renamed within the tree
    Moved,
}

impl EventKind {
    /// Whether the event counts towards spike detection
    pub fn is_modification(&self) -> bool {
        matches!(self, EventKind::Created | EventKind::Modified | EventKind::Moved)
    }

    /// Matching audit log event type
    pub fn audit_type(&self) -> AuditEventType {
        match self {
            EventKind::Created => AuditEventType::Created,
            EventKind::Deleted => AuditEventType::Deleted,
            EventKind::Modified => AuditEventType::Modified,
            EventKind::Moved => AuditEventType::Moved,
        }
    }
}

/// File system event as reported by the watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: EventKind,
    /// Affected path; the origin for moves
    pub source_path: Option<PathBuf>,
    /// Destination of a move
    pub dest_path: Option<PathBuf>,
    pub observed_at: DateTime<Utc>,
}

impl RawEvent {
    fn single(kind: EventKind, path: PathBuf) -> Self {
        Self {
            kind,
            source_path: Some(path),
            dest_path: None,
            observed_at: Utc::now(),
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::single(EventKind::Created, path.into())
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::single(EventKind::Deleted, path.into())
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::single(EventKind::Modified, path.into())
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::Moved,
            source_path: Some(from.into()),
            dest_path: Some(to.into()),
            observed_at: Utc::now(),
        }
    }

    /// Set the observation time
    pub fn at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    /// Exactly one path for create/delete/modify, both for moves
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            EventKind::Moved => self.source_path.is_some() && self.dest_path.is_some(),
            _ => self.source_path.is_some() != self.dest_path.is_some(),
        }
    }

    /// Source path, else destination path
    pub fn primary_path(&self) -> Option<&Path> {
        self.source_path.as_deref().or(self.dest_path.as_deref())
    }

    /// All paths the event mentions
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.source_path
            .as_deref()
            .into_iter()
            .chain(self.dest_path.as_deref())
    }
}

/// Receiving end of the event queue, plus the producer task
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<RawEvent>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl EventQueue {
    /// Wrap a receiver and the task feeding it
    pub fn new(rx: mpsc::UnboundedReceiver<RawEvent>, task: JoinHandle<anyhow::Result<()>>) -> Self {
        Self { rx, task }
    }

    /// Next event; `None` once the producer has stopped
    pub async fn recv(&mut self) -> Option<RawEvent> {
        self.rx.recv().await
    }

    /// Why the producer stopped. Call after [`recv`](Self::recv) returned `None`.
    pub async fn failure(&mut self) -> Error {
        let cause = match (&mut self.task).await {
            Ok(Ok(())) => "watcher stopped unexpectedly".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("watcher task aborted: {}", e),
        };
        Error::Watcher(cause)
    }
}

/// Recursive watcher over the monitored root
pub struct Watcher {
    inotify: InotifyWatcher,
    root: PathBuf,
}

impl Watcher {
    /// Set up watches for the whole tree. Must be called within a tokio runtime.
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let mut inotify = InotifyWatcher::new(settings.filter.clone())?;
        inotify.add(&settings.monitor_root)?;
        info!(
            "Watching: {:?} ({} directories)",
            settings.monitor_root,
            inotify.watch_count()
        );

        Ok(Self {
            inotify,
            root: settings.monitor_root.clone(),
        })
    }

    /// Run the watcher in its own task, feeding an unbounded queue
    pub fn spawn(self) -> EventQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        let Watcher { mut inotify, root } = self;

        let task = tokio::spawn(async move {
            loop {
                match inotify.next_event().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            // Consumer gone, nothing left to do
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        error!("Watcher for {:?} failed: {}", root, e);
                        return Err(e);
                    }
                }
            }
        });

        EventQueue::new(rx, task)
    }
}
