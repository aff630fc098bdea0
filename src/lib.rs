//! fsguard - directory monitoring with modification-spike alerts and
//! snapshot restore
//!
//! fsguard watches a directory tree, keeps a mirrored snapshot of the files
//! it tracks, and raises an alert when files change faster than a person
//! plausibly would (a burst consistent with mass encryption). The operator
//! then either accepts the changes, which updates the snapshot, or restores
//! affected files from it. Every event and every action lands in an
//! append-only CSV audit log.
//!
//! # Features
//!
//! - **Scope filter** - track everything, or named files and relative paths
//! - **Snapshots** - plain mirrored directory, no index
//! - **Spike detection** - sliding window with threshold and cooldown
//! - **Restore** - overwrite from snapshot and keep a timestamped duplicate
//! - **Audit trail** - one CSV record per event and per action
//!
//! # Example
//!
//! ```rust,no_run
//! use fsguard::{Command, Config, Guard};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Config::with_root("/srv/share", Path::new("/var/lib/fsguard")).validate()?;
//!     let mut guard = Guard::new(settings).start().await?;
//!
//!     println!("{:?}", guard.request(Command::Status).await?);
//!
//!     while let Some(notification) = guard.notifications.recv().await {
//!         println!("{:?}", notification);
//!     }
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod crypt;
pub mod daemon;
pub mod detector;
pub mod error;
pub mod filter;
pub mod orchestrator;
pub mod response;
pub mod snapshot;
pub mod watcher;

pub use config::{Config, Settings};
pub use detector::{AlertPayload, SpikeDetector};
pub use error::{Error, Result};
pub use filter::{PathFilter, ScopeFilter};
pub use orchestrator::{Command, Notification, Orchestrator, Reply};
pub use response::RestoreManager;
pub use snapshot::SnapshotStore;
pub use watcher::Watcher;

use orchestrator::Request;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Queued operator commands before senders wait
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Main fsguard engine
pub struct Guard {
    settings: Settings,
}

impl Guard {
    /// Create a new engine from validated settings
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Start watching, take the initial snapshot and run the event loop.
    ///
    /// The watcher is armed before the snapshot sweep so changes made during
    /// the sweep still arrive as events.
    pub async fn start(self) -> anyhow::Result<GuardHandle> {
        let queue = Watcher::new(&self.settings)?.spawn();

        let store = SnapshotStore::new(&self.settings);
        let sweep = store.clone();
        tokio::task::spawn_blocking(move || sweep.initialize()).await??;

        let (commands, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (note_tx, notifications) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(&self.settings, store);
        let monitoring = tokio::spawn(orchestrator.run(queue, cmd_rx, note_tx));

        Ok(GuardHandle {
            commands,
            notifications,
            monitoring,
        })
    }

    /// Get current settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// Channels to a running engine
pub struct GuardHandle {
    /// Operator commands
    pub commands: mpsc::Sender<Request>,
    /// Events and alerts as they happen
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    /// The event loop; finishes only on a fatal error or once every command
    /// sender is gone
    pub monitoring: JoinHandle<Result<()>>,
}

impl GuardHandle {
    /// Submit a command and wait for its reply
    pub async fn request(&self, command: Command) -> anyhow::Result<Reply> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .await
            .map_err(|_| anyhow::anyhow!("monitoring has stopped"))?;
        Ok(rx.await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn next_alert(handle: &mut GuardHandle) -> AlertPayload {
        let wait = async {
            loop {
                match handle.notifications.recv().await {
                    Some(Notification::Alert(alert)) => return alert,
                    Some(Notification::Event(_)) => continue,
                    None => panic!("notifications closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for alert")
    }

    #[tokio::test]
    async fn test_burst_alert_then_restore_end_to_end() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        for i in 0..4 {
            fs::write(root.path().join(format!("doc{}.txt", i)), format!("clean {}", i)).unwrap();
        }
        let mut config = Config::with_root(root.path(), state.path());
        config.detection.spike_threshold = 4;
        config.detection.spike_window_secs = 30.0;
        let settings = config.validate().unwrap();
        let base = settings.monitor_root.clone();

        let mut handle = Guard::new(settings.clone()).start().await.unwrap();

        // Simulated mass encryption
        for i in 0..4 {
            fs::write(base.join(format!("doc{}.txt", i)), "xx-encrypted-xx").unwrap();
        }
        let alert = next_alert(&mut handle).await;
        assert!(alert.count >= 4);

        let inspect = match handle.request(Command::ReportNotMe(alert.id)).await.unwrap() {
            Reply::NotMe { inspect, .. } => inspect.unwrap(),
            other => panic!("unexpected reply: {:?}", other),
        };
        let target = inspect.primary_path().unwrap().to_path_buf();

        match handle.request(Command::Restore(inspect.id)).await.unwrap() {
            Reply::Restored { path, .. } => assert_eq!(path, target),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(fs::read_to_string(&target).unwrap().starts_with("clean "));

        let audit = fs::read_to_string(&settings.audit_log).unwrap();
        assert!(audit.contains("user_reported_not_me"));
        assert!(audit.contains("restored_and_duplicated"));
    }

    #[tokio::test]
    async fn test_start_fails_for_vanished_root() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let settings = Config::with_root(root.path(), state.path()).validate().unwrap();
        let gone = settings.monitor_root.clone();
        drop(root);
        assert!(!gone.exists());
        assert!(Guard::new(settings).start().await.is_err());
    }
}
