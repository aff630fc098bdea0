//! Append-only CSV audit trail
//!
//! One record per line with fixed field order
//! `timestamp_iso, event_type, event_path, action_taken, note`. The header is
//! written once, when the file is first created. Records are never rewritten
//! and a failed write is surfaced as [`Error::AuditWrite`], never swallowed.
//!
//! Besides the operator actions, `action_taken` may be `observed`: the record
//! of a plain in-scope event with no action attached. Those records are
//! written only while `audit.record_events` is on.

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// What an audit record is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Created,
    Deleted,
    Modified,
    Moved,
    SnapshotUpdatedByUser,
    UserReportedNotMe,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Created => "created",
            AuditEventType::Deleted => "deleted",
            AuditEventType::Modified => "modified",
            AuditEventType::Moved => "moved",
            AuditEventType::SnapshotUpdatedByUser => "snapshot_updated_by_user",
            AuditEventType::UserReportedNotMe => "user_reported_not_me",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action taken for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Event recorded, nothing else done yet
    Observed,
    IgnoredByUser,
    SnapshotUpdated,
    RestoredAndDuplicated,
    RestoreFailedNoSnapshot,
    RestoreFailedCopyError,
    RestoreButDuplicateFailed,
    AlertShown,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Observed => "observed",
            Action::IgnoredByUser => "ignored_by_user",
            Action::SnapshotUpdated => "snapshot_updated",
            Action::RestoredAndDuplicated => "restored_and_duplicated",
            Action::RestoreFailedNoSnapshot => "restore_failed_no_snapshot",
            Action::RestoreFailedCopyError => "restore_failed_copy_error",
            Action::RestoreButDuplicateFailed => "restore_but_duplicate_failed",
            Action::AlertShown => "alert_shown",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the audit log. All fields are plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp_iso: String,
    pub event_type: String,
    pub event_path: String,
    pub action_taken: String,
    pub note: String,
}

impl AuditRecord {
    /// Record stamped with the current UTC time
    pub fn new(
        event_type: AuditEventType,
        event_path: impl Into<String>,
        action: Action,
        note: impl Into<String>,
    ) -> Self {
        Self {
            timestamp_iso: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            event_path: event_path.into(),
            action_taken: action.to_string(),
            note: note.into(),
        }
    }

    /// Record about a single path
    pub fn for_path(event_type: AuditEventType, path: &Path, action: Action, note: impl Into<String>) -> Self {
        Self::new(event_type, path.display().to_string(), action, note)
    }
}

/// Handle to the audit log file
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    written: u64,
}

impl AuditLog {
    /// Open (lazily) the audit log at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: 0,
        }
    }

    /// Location of the log
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended by this handle
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append one record, writing the header first if the file is new
    pub fn append(&mut self, record: &AuditRecord) -> Result<()> {
        self.write(record).map_err(|source| Error::AuditWrite {
            path: self.path.clone(),
            source,
        })?;
        self.written += 1;
        Ok(())
    }

    fn write(&self, record: &AuditRecord) -> std::result::Result<(), csv::Error> {
        let need_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(need_header)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_records(path: &Path) -> Vec<AuditRecord> {
        csv::Reader::from_path(path)
            .unwrap()
            .deserialize()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/audit.csv");
        let mut log = AuditLog::new(&path);

        log.append(&AuditRecord::new(
            AuditEventType::Modified,
            "/data/a.txt",
            Action::Observed,
            "",
        ))
        .unwrap();
        // A fresh handle must not repeat the header
        let mut again = AuditLog::new(&path);
        again
            .append(&AuditRecord::new(
                AuditEventType::Deleted,
                "/data/b.txt",
                Action::IgnoredByUser,
                "user indicated they performed the action",
            ))
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content.matches("timestamp_iso,event_type,event_path,action_taken,note").count(),
            1
        );
        assert!(content.starts_with("timestamp_iso,"));

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event_type, "deleted");
        assert_eq!(records[1].action_taken, "ignored_by_user");
    }

    #[test]
    fn test_fields_with_commas_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.csv");
        let mut log = AuditLog::new(&path);
        log.append(&AuditRecord::new(
            AuditEventType::UserReportedNotMe,
            "/data/a,b.txt;/data/c.txt",
            Action::AlertShown,
            "count=2",
        ))
        .unwrap();

        let records = read_records(&path);
        assert_eq!(records[0].event_path, "/data/a,b.txt;/data/c.txt");
        assert_eq!(log.written(), 1);
    }

    #[test]
    fn test_write_failure_is_escalated() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened for appending
        let mut log = AuditLog::new(dir.path());
        let err = log
            .append(&AuditRecord::new(AuditEventType::Created, "x", Action::Observed, ""))
            .unwrap_err();
        assert!(matches!(err, Error::AuditWrite { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_vocabulary() {
        assert_eq!(AuditEventType::SnapshotUpdatedByUser.to_string(), "snapshot_updated_by_user");
        assert_eq!(Action::RestoreButDuplicateFailed.to_string(), "restore_but_duplicate_failed");
        assert_eq!(Action::Observed.to_string(), "observed");
    }
}
