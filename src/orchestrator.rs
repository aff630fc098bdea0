//! Event loop tying the watcher, detector, snapshots and audit log together
//!
//! The orchestrator is the single consumer of the event queue and the only
//! mutator of the spike window, event history and audit log. Operator
//! decisions arrive as [`Command`]s and are applied one at a time, in
//! submission order, between events.

use crate::audit::{Action, AuditEventType, AuditLog, AuditRecord};
use crate::config::Settings;
use crate::detector::{AlertPayload, SpikeDetector};
use crate::error::{Error, Result};
use crate::filter::PathFilter;
use crate::response::{ConfirmReport, RestoreManager, RestoreOutcome};
use crate::snapshot::{SnapshotStore, SweepReport};
use crate::watcher::{EventKind, EventQueue, RawEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Run whole-tree filesystem work off the async worker when the runtime
/// allows it. Current-thread runtimes and plain callers run `f` inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Sequence number assigned at ingestion
pub type EventId = u64;

/// In-scope event with its ingestion sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: EventId,
    pub kind: EventKind,
    pub source_path: Option<PathBuf>,
    pub dest_path: Option<PathBuf>,
    /// When the watcher saw it
    pub observed_at: DateTime<Utc>,
    /// When the orchestrator ingested it
    pub ingested_at: DateTime<Utc>,
}

impl NormalizedEvent {
    /// Source path, else destination path
    pub fn primary_path(&self) -> Option<&Path> {
        self.source_path.as_deref().or(self.dest_path.as_deref())
    }

    fn touches(&self, paths: &HashSet<&Path>) -> bool {
        self.source_path.as_deref().is_some_and(|p| paths.contains(p))
            || self.dest_path.as_deref().is_some_and(|p| paths.contains(p))
    }
}

/// Operator decisions and queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// The operator made this change; accept it
    Ignore(EventId),
    /// Restore the event's file from snapshot
    Restore(EventId),
    /// Accept the current content of these paths
    ConfirmBurst(Vec<PathBuf>),
    /// Accept every path of a pending alert
    ConfirmAlert(u64),
    /// The operator did not cause this alert
    ReportNotMe(u64),
    /// Rebuild the snapshot from the current tree (operator already confirmed)
    Refresh,
    Status,
    /// Most recent events, newest first
    Events { limit: usize },
    /// Unresolved alerts
    Alerts,
}

/// Answer to a [`Command`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Error(String),
    Ignored {
        event: EventId,
        /// Snapshot slot updated for the file, if it still existed
        snapshot: Option<PathBuf>,
        /// Why the snapshot could not be updated
        snapshot_error: Option<String>,
    },
    Restored {
        path: PathBuf,
        duplicate: PathBuf,
    },
    /// Restored, but the duplicate could not be saved
    PartiallyRestored {
        path: PathBuf,
        error: String,
    },
    NoSnapshot {
        path: PathBuf,
        expected: Option<PathBuf>,
    },
    RestoreFailed {
        path: PathBuf,
        error: String,
    },
    Confirmed(ConfirmReport),
    NotMe {
        alert: u64,
        /// Newest event touching one of the alert's paths
        inspect: Option<NormalizedEvent>,
    },
    Refreshed(SweepReport),
    Status(Status),
    Events(Vec<NormalizedEvent>),
    Alerts(Vec<AlertPayload>),
}

/// Snapshot of orchestrator state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub pid: u32,
    pub monitor_root: PathBuf,
    pub snapshot_dir: PathBuf,
    pub audit_log: PathBuf,
    pub events_ingested: u64,
    pub history_len: usize,
    pub window_count: usize,
    pub pending_alerts: usize,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub audit_records: u64,
}

/// Pushed to the consumer as things happen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    Event(NormalizedEvent),
    Alert(AlertPayload),
}

/// A command plus the channel its reply goes to
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<Reply>,
}

/// Outcome of ingesting one in-scope event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub event: NormalizedEvent,
    pub alert: Option<AlertPayload>,
}

/// Owner of all mutable monitoring state
pub struct Orchestrator {
    filter: PathFilter,
    detector: SpikeDetector,
    restorer: RestoreManager,
    audit: AuditLog,
    history: VecDeque<NormalizedEvent>,
    history_limit: usize,
    pending_alerts: BTreeMap<u64, AlertPayload>,
    record_events: bool,
    next_id: EventId,
    monitor_root: PathBuf,
}

impl Orchestrator {
    /// Build from validated settings and an initialized snapshot store
    pub fn new(settings: &Settings, snapshots: SnapshotStore) -> Self {
        Self {
            filter: settings.filter.clone(),
            detector: SpikeDetector::new(
                settings.spike_window,
                settings.spike_threshold,
                settings.alert_cooldown,
            ),
            restorer: RestoreManager::new(settings, snapshots),
            audit: AuditLog::new(&settings.audit_log),
            history: VecDeque::new(),
            history_limit: settings.history_limit,
            pending_alerts: BTreeMap::new(),
            record_events: settings.record_events,
            next_id: 1,
            monitor_root: settings.monitor_root.clone(),
        }
    }

    /// Ingest a raw event at the current time
    pub fn ingest(&mut self, raw: RawEvent) -> Result<Option<Ingested>> {
        self.ingest_at(raw, Utc::now())
    }

    /// Ingest a raw event at `now`.
    ///
    /// Out-of-scope events return `Ok(None)` and leave no trace. The only
    /// error is a failed audit write.
    pub fn ingest_at(&mut self, raw: RawEvent, now: DateTime<Utc>) -> Result<Option<Ingested>> {
        if !raw.is_well_formed() {
            warn!("Dropping malformed event: {:?}", raw);
            return Ok(None);
        }
        if !raw.paths().any(|p| self.filter.matches(p)) {
            return Ok(None);
        }

        let event = NormalizedEvent {
            id: self.next_id,
            kind: raw.kind,
            source_path: raw.source_path,
            dest_path: raw.dest_path,
            observed_at: raw.observed_at,
            ingested_at: now,
        };
        self.next_id += 1;
        debug!("Event #{} {:?} {:?}", event.id, event.kind, event.primary_path());

        if self.record_events {
            let note = event
                .dest_path
                .as_ref()
                .filter(|_| event.kind == EventKind::Moved)
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let path = event.primary_path().map(|p| p.display().to_string()).unwrap_or_default();
            self.audit.append(&AuditRecord::new(
                event.kind.audit_type(),
                path,
                Action::Observed,
                note,
            ))?;
        }

        let mut alert = None;
        if event.kind.is_modification() {
            if let Some(path) = event.primary_path() {
                self.detector.record_modification_at(path, now);
            }
            alert = self.detector.maybe_trigger_at(now);
            if let Some(ref a) = alert {
                warn!(
                    "Modification spike: {} changes in window, alert #{} raised",
                    a.count, a.id
                );
                self.pending_alerts.insert(a.id, a.clone());
            }
        }

        self.history.push_back(event.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }

        Ok(Some(Ingested { event, alert }))
    }

    /// Apply one operator command.
    ///
    /// Per-file failures become [`Reply`] values; only fatal errors (audit
    /// write failures) are returned as `Err`.
    pub fn apply(&mut self, command: Command) -> Result<Reply> {
        match command {
            Command::Ignore(id) => self.ignore(id),
            Command::Restore(id) => self.restore(id),
            Command::ConfirmBurst(paths) => self.confirm(&paths),
            Command::ConfirmAlert(id) => match self.pending_alerts.remove(&id) {
                Some(alert) => self.confirm(&alert.paths),
                None => Ok(Reply::Error(format!("no pending alert #{}", id))),
            },
            Command::ReportNotMe(id) => self.report_not_me(id),
            Command::Refresh => match blocking(|| self.restorer.snapshots().refresh()) {
                Ok(report) => Ok(Reply::Refreshed(report)),
                Err(e) => {
                    error!("Snapshot refresh failed: {}", e);
                    Ok(Reply::Error(e.to_string()))
                }
            },
            Command::Status => Ok(Reply::Status(self.status())),
            Command::Events { limit } => Ok(Reply::Events(
                self.history.iter().rev().take(limit).cloned().collect(),
            )),
            Command::Alerts => Ok(Reply::Alerts(self.pending_alerts.values().cloned().collect())),
        }
    }

    fn event(&self, id: EventId) -> Option<&NormalizedEvent> {
        // History is ordered by id
        let front = self.history.front()?.id;
        let event = self.history.get(id.checked_sub(front)? as usize)?;
        (event.id == id).then_some(event)
    }

    fn ignore(&mut self, id: EventId) -> Result<Reply> {
        let Some(event) = self.event(id).cloned() else {
            return Ok(Reply::Error(format!("unknown event #{}", id)));
        };
        let Some(path) = event.primary_path() else {
            return Ok(Reply::Error(format!("event #{} has no path", id)));
        };

        self.audit.append(&AuditRecord::for_path(
            event.kind.audit_type(),
            path,
            Action::IgnoredByUser,
            "user indicated they performed the action",
        ))?;

        let (mut snapshot, mut snapshot_error) = (None, None);
        if let Some(source) = event.source_path.as_deref().filter(|p| p.is_file()) {
            match self.restorer.snapshots().update(source) {
                Ok(slot) => snapshot = Some(slot),
                Err(e) => {
                    warn!("Could not update snapshot after ignore: {}", e);
                    snapshot_error = Some(e.to_string());
                }
            }
        }
        Ok(Reply::Ignored {
            event: id,
            snapshot,
            snapshot_error,
        })
    }

    fn restore(&mut self, id: EventId) -> Result<Reply> {
        let Some(event) = self.event(id).cloned() else {
            return Ok(Reply::Error(format!("unknown event #{}", id)));
        };
        let Some(path) = event.primary_path().map(Path::to_path_buf) else {
            return Ok(Reply::Error(format!("event #{} has no path", id)));
        };

        match self.restorer.restore(&path, event.kind.audit_type(), &mut self.audit) {
            Ok(RestoreOutcome::Restored { duplicate, .. }) => Ok(Reply::Restored { path, duplicate }),
            Ok(RestoreOutcome::DuplicateFailed { error, .. }) => Ok(Reply::PartiallyRestored {
                path,
                error: error.to_string(),
            }),
            Err(e) if e.is_fatal() => Err(e),
            Err(Error::NoSnapshot { path, expected }) => Ok(Reply::NoSnapshot { path, expected }),
            Err(e) => Ok(Reply::RestoreFailed {
                path,
                error: e.to_string(),
            }),
        }
    }

    fn confirm(&mut self, paths: &[PathBuf]) -> Result<Reply> {
        let report = self.restorer.confirm_legitimate(paths, &mut self.audit)?;

        // Alerts whose every path was just accepted are resolved
        let accepted: HashSet<&Path> = report.updated.iter().map(PathBuf::as_path).collect();
        self.pending_alerts
            .retain(|_, alert| !alert.paths.iter().all(|p| accepted.contains(p.as_path())));

        Ok(Reply::Confirmed(report))
    }

    fn report_not_me(&mut self, id: u64) -> Result<Reply> {
        let Some(alert) = self.pending_alerts.remove(&id) else {
            return Ok(Reply::Error(format!("no pending alert #{}", id)));
        };

        let joined = alert
            .paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(";");
        self.audit.append(&AuditRecord::new(
            AuditEventType::UserReportedNotMe,
            joined,
            Action::AlertShown,
            format!("count={}", alert.count),
        ))?;
        info!("User reported alert #{} as not their activity", id);

        let paths: HashSet<&Path> = alert.paths.iter().map(PathBuf::as_path).collect();
        let inspect = self.history.iter().rev().find(|e| e.touches(&paths)).cloned();
        Ok(Reply::NotMe { alert: id, inspect })
    }

    fn status(&self) -> Status {
        Status {
            pid: std::process::id(),
            monitor_root: self.monitor_root.clone(),
            snapshot_dir: self.restorer.snapshots().root().to_path_buf(),
            audit_log: self.audit.path().to_path_buf(),
            events_ingested: self.next_id - 1,
            history_len: self.history.len(),
            window_count: self.detector.count_in_window(),
            pending_alerts: self.pending_alerts.len(),
            last_alert_at: self.detector.last_alert_at(),
            audit_records: self.audit.written(),
        }
    }

    /// Run until the command channel closes or a fatal error occurs
    pub async fn run(
        mut self,
        mut events: EventQueue,
        mut commands: mpsc::Receiver<Request>,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Result<()> {
        info!("Monitoring {:?}", self.monitor_root);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(raw) => {
                        if let Some(Ingested { event, alert }) = self.ingest(raw)? {
                            // A missing consumer is not an error
                            let _ = notifications.send(Notification::Event(event));
                            if let Some(alert) = alert {
                                let _ = notifications.send(Notification::Alert(alert));
                            }
                        }
                    }
                    None => {
                        let e = events.failure().await;
                        error!("{}", e);
                        return Err(e);
                    }
                },
                request = commands.recv() => match request {
                    Some(Request { command, reply }) => {
                        debug!("Applying {:?}", command);
                        match self.apply(command) {
                            Ok(answer) => {
                                let _ = reply.send(answer);
                            }
                            Err(e) => {
                                error!("Fatal error while applying command: {}", e);
                                let _ = reply.send(Reply::Error(e.to_string()));
                                return Err(e);
                            }
                        }
                    }
                    None => {
                        info!("Command channel closed, stopping");
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _root: TempDir,
        _state: TempDir,
        base: PathBuf,
        settings: Settings,
        orch: Orchestrator,
    }

    fn fixture_with(files: &[&str], threshold: usize) -> Fixture {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let mut config = Config::with_root(root.path(), state.path());
        config.files = files.iter().map(|s| s.to_string()).collect();
        config.detection.spike_threshold = threshold;
        let settings = config.validate().unwrap();
        let base = settings.monitor_root.clone();
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(base.join(name), format!("clean {}", name)).unwrap();
        }

        let store = SnapshotStore::new(&settings);
        store.initialize().unwrap();
        let orch = Orchestrator::new(&settings, store);
        Fixture {
            _root: root,
            _state: state,
            base,
            settings,
            orch,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(&[], 8)
    }

    fn audit_actions(settings: &Settings) -> Vec<(String, String, String)> {
        if !settings.audit_log.exists() {
            return Vec::new();
        }
        csv::Reader::from_path(&settings.audit_log)
            .unwrap()
            .deserialize::<AuditRecord>()
            .map(|r| {
                let r = r.unwrap();
                (r.event_type, r.event_path, r.action_taken)
            })
            .collect()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_out_of_scope_events_leave_no_trace() {
        let mut f = fixture_with(&["a.txt"], 8);
        let out = f.orch.ingest(RawEvent::modified(f.base.join("b.txt"))).unwrap();
        assert!(out.is_none());
        assert!(audit_actions(&f.settings).is_empty());
        assert_eq!(f.orch.status().history_len, 0);

        let inside = f.orch.ingest(RawEvent::modified(f.base.join("a.txt"))).unwrap().unwrap();
        assert_eq!(inside.event.id, 1);
        assert_eq!(audit_actions(&f.settings).len(), 1);
    }

    #[test]
    fn test_tool_owned_paths_are_never_ingested() {
        let root = tempdir().unwrap();
        let config = Config::with_root(root.path(), &root.path().join(".fsguard"));
        let settings = config.validate().unwrap();
        let store = SnapshotStore::new(&settings);
        store.initialize().unwrap();
        let mut orch = Orchestrator::new(&settings, store);

        let snap = settings.snapshot_dir.join("x.txt");
        assert!(orch.ingest(RawEvent::modified(snap)).unwrap().is_none());
        let log = RawEvent::modified(settings.audit_log.clone());
        assert!(orch.ingest(log).unwrap().is_none());
    }

    #[test]
    fn test_moves_in_scope_by_either_path() {
        let mut f = fixture_with(&["a.txt"], 8);
        let moved = RawEvent::moved(f.base.join("tmp.bin"), f.base.join("a.txt"));
        let ingested = f.orch.ingest(moved).unwrap().unwrap();
        assert_eq!(ingested.event.kind, EventKind::Moved);
        assert_eq!(f.orch.detector.count_in_window(), 1);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut f = fixture();
        let ids: Vec<EventId> = (0..3)
            .map(|_| {
                f.orch
                    .ingest(RawEvent::modified(f.base.join("a.txt")))
                    .unwrap()
                    .unwrap()
                    .event
                    .id
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_deletions_do_not_count_towards_spikes() {
        let mut f = fixture_with(&[], 2);
        for i in 0..5 {
            let raw = RawEvent::deleted(f.base.join(format!("f{}.txt", i)));
            let out = f.orch.ingest_at(raw, t(0)).unwrap().unwrap();
            assert!(out.alert.is_none());
        }
        assert_eq!(f.orch.detector.count_in_window(), 0);
    }

    #[test]
    fn test_burst_raises_one_alert_then_respects_cooldown() {
        let mut f = fixture();
        let mut alerts = Vec::new();
        for i in 0..8 {
            let raw = RawEvent::modified(f.base.join(format!("f{}.txt", i)));
            if let Some(a) = f.orch.ingest_at(raw, t(i.min(4))).unwrap().unwrap().alert {
                alerts.push(a);
            }
        }
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].paths.len(), 8);

        for secs in [10, 15] {
            let raw = RawEvent::modified(f.base.join("late.txt"));
            assert!(f.orch.ingest_at(raw, t(secs)).unwrap().unwrap().alert.is_none());
        }

        let mut again = None;
        for i in 0..8 {
            let raw = RawEvent::modified(f.base.join(format!("g{}.txt", i)));
            if let Some(a) = f.orch.ingest_at(raw, t(61 + i.min(4))).unwrap().unwrap().alert {
                again = Some(a);
            }
        }
        assert_eq!(again.map(|a| a.id), Some(2));
        match f.orch.apply(Command::Alerts).unwrap() {
            Reply::Alerts(pending) => assert_eq!(pending.len(), 2),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let mut config = Config::with_root(root.path(), state.path());
        config.history_limit = 2;
        let settings = config.validate().unwrap();
        let mut orch = Orchestrator::new(&settings, SnapshotStore::new(&settings));
        let base = settings.monitor_root.clone();

        for i in 0..5 {
            orch.ingest(RawEvent::deleted(base.join(format!("{}.txt", i)))).unwrap();
        }
        match orch.apply(Command::Events { limit: 10 }).unwrap() {
            Reply::Events(events) => {
                assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![5, 4]);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(matches!(orch.apply(Command::Restore(1)).unwrap(), Reply::Error(_)));
    }

    #[test]
    fn test_restore_command_restores_and_audits() {
        let mut f = fixture();
        let target = f.base.join("a.txt");
        fs::write(&target, "tampered").unwrap();
        let id = f.orch.ingest(RawEvent::modified(&target)).unwrap().unwrap().event.id;

        match f.orch.apply(Command::Restore(id)).unwrap() {
            Reply::Restored { path, duplicate } => {
                assert_eq!(path, target);
                assert_eq!(fs::read_to_string(duplicate).unwrap(), "clean a.txt");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(fs::read_to_string(&target).unwrap(), "clean a.txt");

        let actions: Vec<String> = audit_actions(&f.settings).into_iter().map(|(_, _, a)| a).collect();
        assert_eq!(actions, vec!["observed", "restored_and_duplicated"]);
    }

    #[test]
    fn test_restore_without_snapshot_is_not_fatal() {
        let mut f = fixture();
        let fresh = f.base.join("fresh.txt");
        fs::write(&fresh, "new").unwrap();
        let id = f.orch.ingest(RawEvent::created(&fresh)).unwrap().unwrap().event.id;

        let reply = f.orch.apply(Command::Restore(id)).unwrap();
        assert!(matches!(reply, Reply::NoSnapshot { expected: Some(_), .. }));
        assert_eq!(fs::read_to_string(&fresh).unwrap(), "new");
    }

    #[test]
    fn test_ignore_updates_snapshot() {
        let mut f = fixture();
        let target = f.base.join("b.txt");
        fs::write(&target, "intended edit").unwrap();
        let id = f.orch.ingest(RawEvent::modified(&target)).unwrap().unwrap().event.id;

        match f.orch.apply(Command::Ignore(id)).unwrap() {
            Reply::Ignored { snapshot: Some(slot), snapshot_error: None, .. } => {
                assert_eq!(fs::read_to_string(slot).unwrap(), "intended edit");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        let last = audit_actions(&f.settings).pop().unwrap();
        assert_eq!(
            last,
            (
                "modified".to_string(),
                target.display().to_string(),
                "ignored_by_user".to_string()
            )
        );
    }

    #[test]
    fn test_ignore_deleted_file_only_audits() {
        let mut f = fixture();
        let target = f.base.join("c.txt");
        fs::remove_file(&target).unwrap();
        let id = f.orch.ingest(RawEvent::deleted(&target)).unwrap().unwrap().event.id;

        assert!(matches!(
            f.orch.apply(Command::Ignore(id)).unwrap(),
            Reply::Ignored { snapshot: None, snapshot_error: None, .. }
        ));
        // Snapshot of the deleted file stays intact
        let slot = f.orch.restorer.snapshots().lookup(&target).unwrap();
        assert_eq!(fs::read_to_string(slot).unwrap(), "clean c.txt");
    }

    #[test]
    fn test_confirm_alert_updates_snapshots_and_resolves() {
        let mut f = fixture_with(&[], 2);
        let (a, b) = (f.base.join("a.txt"), f.base.join("b.txt"));
        fs::write(&a, "a2").unwrap();
        fs::write(&b, "b2").unwrap();
        f.orch.ingest_at(RawEvent::modified(&a), t(0)).unwrap();
        let alert = f
            .orch
            .ingest_at(RawEvent::modified(&b), t(1))
            .unwrap()
            .unwrap()
            .alert
            .unwrap();

        match f.orch.apply(Command::ConfirmAlert(alert.id)).unwrap() {
            Reply::Confirmed(report) => assert_eq!(report.updated, vec![a.clone(), b.clone()]),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(f.orch.status().pending_alerts, 0);
        let slot = f.orch.restorer.snapshots().lookup(&b).unwrap();
        assert_eq!(fs::read_to_string(slot).unwrap(), "b2");

        let confirmed = audit_actions(&f.settings)
            .into_iter()
            .filter(|(t, _, _)| t == "snapshot_updated_by_user")
            .count();
        assert_eq!(confirmed, 2);
        assert!(matches!(
            f.orch.apply(Command::ConfirmAlert(alert.id)).unwrap(),
            Reply::Error(_)
        ));
    }

    #[test]
    fn test_confirm_burst_resolves_covered_alerts() {
        let mut f = fixture_with(&[], 1);
        let a = f.base.join("a.txt");
        let alert = f.orch.ingest_at(RawEvent::modified(&a), t(0)).unwrap().unwrap().alert;
        assert!(alert.is_some());

        f.orch.apply(Command::ConfirmBurst(vec![a])).unwrap();
        assert_eq!(f.orch.status().pending_alerts, 0);
    }

    #[test]
    fn test_confirm_burst_ignores_unmonitored_paths() {
        let mut f = fixture_with(&["a.txt"], 8);
        let secret = f.base.join("b.txt");
        let escaping = f.base.join("../../etc/passwd");

        match f.orch.apply(Command::ConfirmBurst(vec![secret, escaping])).unwrap() {
            Reply::Confirmed(report) => {
                assert!(report.updated.is_empty());
                assert_eq!(report.failed.len(), 2);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(!f.settings.snapshot_dir.join("b.txt").exists());
        assert!(audit_actions(&f.settings).is_empty());
    }

    #[test]
    fn test_report_not_me_points_at_newest_event() {
        let mut f = fixture_with(&[], 2);
        let (a, b) = (f.base.join("a.txt"), f.base.join("b.txt"));
        f.orch.ingest_at(RawEvent::modified(&a), t(0)).unwrap();
        let ingested = f.orch.ingest_at(RawEvent::modified(&b), t(1)).unwrap().unwrap();
        let alert = ingested.alert.unwrap();

        match f.orch.apply(Command::ReportNotMe(alert.id)).unwrap() {
            Reply::NotMe { alert: id, inspect } => {
                assert_eq!(id, alert.id);
                assert_eq!(inspect.map(|e| e.id), Some(ingested.event.id));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let last = audit_actions(&f.settings).pop().unwrap();
        assert_eq!(last.0, "user_reported_not_me");
        assert_eq!(last.1, format!("{};{}", a.display(), b.display()));
        assert_eq!(last.2, "alert_shown");
    }

    #[test]
    fn test_refresh_rebuilds_snapshot() {
        let mut f = fixture();
        fs::write(f.base.join("a.txt"), "fresh").unwrap();
        match f.orch.apply(Command::Refresh).unwrap() {
            Reply::Refreshed(report) => assert_eq!(report.copied, 3),
            other => panic!("unexpected reply: {:?}", other),
        }
        let slot = f.orch.restorer.snapshots().lookup(&f.base.join("a.txt")).unwrap();
        assert_eq!(fs::read_to_string(slot).unwrap(), "fresh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_inside_multi_thread_runtime() {
        let mut f = fixture();
        fs::write(f.base.join("b.txt"), "rewritten").unwrap();
        match f.orch.apply(Command::Refresh).unwrap() {
            Reply::Refreshed(report) => assert_eq!(report.copied, 3),
            other => panic!("unexpected reply: {:?}", other),
        }
        let slot = f.orch.restorer.snapshots().lookup(&f.base.join("b.txt")).unwrap();
        assert_eq!(fs::read_to_string(slot).unwrap(), "rewritten");
    }

    #[test]
    fn test_audit_failure_is_fatal() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let mut config = Config::with_root(root.path(), state.path());
        // A directory where the audit file should be
        config.audit_log = state.path().to_path_buf();
        let settings = config.validate().unwrap();
        let mut orch = Orchestrator::new(&settings, SnapshotStore::new(&settings));

        let err = orch
            .ingest(RawEvent::modified(settings.monitor_root.join("a.txt")))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_status_counts() {
        let mut f = fixture();
        f.orch.ingest(RawEvent::modified(f.base.join("a.txt"))).unwrap();
        match f.orch.apply(Command::Status).unwrap() {
            Reply::Status(status) => {
                assert_eq!(status.events_ingested, 1);
                assert_eq!(status.window_count, 1);
                assert_eq!(status.audit_records, 1);
                assert_eq!(status.monitor_root, f.base);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_processes_events_and_commands() {
        let f = fixture();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let producer = tokio::spawn(async { std::future::pending::<anyhow::Result<()>>().await });
        let queue = EventQueue::new(event_rx, producer);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (note_tx, mut note_rx) = mpsc::unbounded_channel();

        let base = f.base.clone();
        let handle = tokio::spawn(f.orch.run(queue, cmd_rx, note_tx));

        event_tx.send(RawEvent::modified(base.join("a.txt"))).unwrap();
        match note_rx.recv().await.unwrap() {
            Notification::Event(e) => assert_eq!(e.id, 1),
            other => panic!("unexpected notification: {:?}", other),
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Request {
                command: Command::Events { limit: 5 },
                reply: reply_tx,
            })
            .await
            .unwrap();
        assert!(matches!(reply_rx.await.unwrap(), Reply::Events(events) if events.len() == 1));

        drop(cmd_tx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_surfaces_watcher_failure() {
        let f = fixture();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RawEvent>();
        let producer = tokio::spawn(async move {
            drop(event_tx);
            Err::<(), _>(anyhow::anyhow!("watch limit reached"))
        });
        let queue = EventQueue::new(event_rx, producer);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let (note_tx, _note_rx) = mpsc::unbounded_channel();

        let err = f.orch.run(queue, cmd_rx, note_tx).await.unwrap_err();
        assert!(matches!(err, Error::Watcher(ref cause) if cause.contains("watch limit")));
    }
}
