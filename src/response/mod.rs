//! Operator responses: restore from snapshot, confirm legitimate changes

pub mod alert;

pub use alert::send_alert;

use crate::audit::{Action, AuditEventType, AuditLog, AuditRecord};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::filter::PathFilter;
use crate::snapshot::{copy_preserving, SnapshotStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Attempts at a free duplicate name before giving up
const MAX_DUPLICATE_ATTEMPTS: u32 = 100;

/// Result of a restore that got as far as overwriting the live file
#[derive(Debug)]
pub enum RestoreOutcome {
    /// Live file restored and the clean content preserved as a duplicate
    Restored { snapshot: PathBuf, duplicate: PathBuf },
    /// Live file restored, but saving the duplicate failed
    DuplicateFailed { snapshot: PathBuf, error: Error },
}

/// Result of confirming a set of paths as legitimate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmReport {
    /// Paths whose snapshot now matches the live file
    pub updated: Vec<PathBuf>,
    /// Paths no longer present on disk
    pub skipped: Vec<PathBuf>,
    /// Paths whose snapshot could not be updated, with the cause
    pub failed: Vec<(PathBuf, String)>,
}

/// Restores snapshot content and keeps duplicates of what was restored
#[derive(Debug, Clone)]
pub struct RestoreManager {
    monitor_root: PathBuf,
    duplicates_root: PathBuf,
    filter: PathFilter,
    snapshots: SnapshotStore,
}

impl RestoreManager {
    pub fn new(settings: &Settings, snapshots: SnapshotStore) -> Self {
        Self {
            monitor_root: settings.monitor_root.clone(),
            duplicates_root: settings.duplicates_dir.clone(),
            filter: settings.filter.clone(),
            snapshots,
        }
    }

    /// Snapshot store used for lookups and updates
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// `<duplicates_root>/<rel dir>/<basename>.<YYYYMMDDTHHMMSS>.orig`
    pub fn duplicate_path(&self, original: &Path, at: DateTime<Utc>) -> Option<PathBuf> {
        let rel = original.strip_prefix(&self.monitor_root).ok()?;
        let name = rel.file_name()?.to_string_lossy();
        let dir = rel.parent().unwrap_or_else(|| Path::new(""));
        Some(
            self.duplicates_root
                .join(dir)
                .join(format!("{}.{}.orig", name, at.format("%Y%m%dT%H%M%S"))),
        )
    }

    /// Overwrite `original` with its snapshot, then save a timestamped copy of
    /// the snapshot content into the duplicates area.
    ///
    /// The suspicious live content is overwritten and not kept. After a
    /// [`Error::RestoreIo`] the live file's state is unspecified. Every outcome
    /// writes exactly one audit record; an audit failure wins over any other
    /// error.
    pub fn restore(
        &self,
        original: &Path,
        event_type: AuditEventType,
        audit: &mut AuditLog,
    ) -> Result<RestoreOutcome> {
        let snapshot = match self.snapshots.lookup(original) {
            Some(path) if path.is_file() => path,
            expected => {
                let note = expected
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                warn!("No snapshot found for {:?}, cannot restore", original);
                audit.append(&AuditRecord::for_path(
                    event_type,
                    original,
                    Action::RestoreFailedNoSnapshot,
                    note,
                ))?;
                return Err(Error::NoSnapshot {
                    path: original.to_path_buf(),
                    expected,
                });
            }
        };

        if let Err(e) = self.overwrite(&snapshot, original) {
            warn!("Restore failed for {:?}: {}", original, e);
            audit.append(&AuditRecord::for_path(
                event_type,
                original,
                Action::RestoreFailedCopyError,
                e.to_string(),
            ))?;
            return Err(Error::RestoreIo {
                path: original.to_path_buf(),
                source: e,
            });
        }

        match self.save_duplicate(&snapshot, original) {
            Ok(duplicate) => {
                info!("Restored {:?} and saved duplicate to {:?}", original, duplicate);
                audit.append(&AuditRecord::for_path(
                    event_type,
                    original,
                    Action::RestoredAndDuplicated,
                    duplicate.display().to_string(),
                ))?;
                Ok(RestoreOutcome::Restored { snapshot, duplicate })
            }
            Err(e) => {
                warn!("Restored {:?} but failed to save duplicate: {}", original, e);
                audit.append(&AuditRecord::for_path(
                    event_type,
                    original,
                    Action::RestoreButDuplicateFailed,
                    e.to_string(),
                ))?;
                Ok(RestoreOutcome::DuplicateFailed {
                    snapshot,
                    error: Error::DuplicateSave {
                        path: original.to_path_buf(),
                        source: e,
                    },
                })
            }
        }
    }

    fn overwrite(&self, snapshot: &Path, original: &Path) -> io::Result<()> {
        if let Some(parent) = original.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_preserving(snapshot, original)?;
        Ok(())
    }

    fn save_duplicate(&self, snapshot: &Path, original: &Path) -> io::Result<PathBuf> {
        let duplicate = self.duplicate_path(original, Utc::now()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "path is outside the monitored root",
            )
        })?;
        if let Some(parent) = duplicate.parent() {
            fs::create_dir_all(parent)?;
        }
        let duplicate = reserve_duplicate(&duplicate)?;
        copy_preserving(snapshot, &duplicate)?;
        Ok(duplicate)
    }

    /// Accept the current content of `paths` as the new trusted state.
    ///
    /// Paths outside the monitored scope are reported as failed and leave no
    /// audit record.
    pub fn confirm_legitimate(&self, paths: &[PathBuf], audit: &mut AuditLog) -> Result<ConfirmReport> {
        let mut report = ConfirmReport::default();

        for requested in paths {
            let path = match self.filter.resolve(requested) {
                Some(path) if self.filter.matches(&path) => path,
                _ => {
                    warn!("Refusing to confirm {:?}: not a monitored file", requested);
                    report
                        .failed
                        .push((requested.clone(), "not a monitored file".to_string()));
                    continue;
                }
            };
            if !path.is_file() {
                report.skipped.push(path);
                continue;
            }
            match self.snapshots.update(&path) {
                Ok(slot) => {
                    audit.append(&AuditRecord::for_path(
                        AuditEventType::SnapshotUpdatedByUser,
                        &path,
                        Action::SnapshotUpdated,
                        slot.display().to_string(),
                    ))?;
                    report.updated.push(path);
                }
                Err(e) => {
                    warn!("Snapshot update failed for {:?}: {}", path, e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        info!(
            "User confirmed activity (updated snapshots for {} files)",
            report.updated.len()
        );
        Ok(report)
    }
}

/// Claim `base`, or `<name>-N.orig` next to it when earlier duplicates from
/// the same second already exist. Existing duplicates are never overwritten.
fn reserve_duplicate(base: &Path) -> io::Result<PathBuf> {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(".orig").unwrap_or(&name);

    let mut candidate = base.to_path_buf();
    for n in 1..=MAX_DUPLICATE_ATTEMPTS {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                candidate = base.with_file_name(format!("{}-{}.orig", stem, n));
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free duplicate name next to {}", base.display()),
    ))
}
