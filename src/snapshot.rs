//! Snapshot store
//!
//! A mirrored directory holding a copy of every in-scope file as it was at
//! the last trusted point. There is no index: the snapshot of
//! `<monitor_root>/<rel>` lives at `<snapshot_root>/<rel>`.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::filter::{normalize_relative, PathFilter};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Outcome of a full snapshot sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Files copied into the mirror
    pub copied: usize,
    /// Files that could not be copied (logged as warnings)
    pub failed: usize,
}

/// Mirrored copy of the monitored tree
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    monitor_root: PathBuf,
    snapshot_root: PathBuf,
    filter: PathFilter,
}

impl SnapshotStore {
    /// Create a store for the configured root and snapshot directory
    pub fn new(settings: &Settings) -> Self {
        Self {
            monitor_root: settings.monitor_root.clone(),
            snapshot_root: settings.snapshot_dir.clone(),
            filter: settings.filter.clone(),
        }
    }

    /// Snapshot directory
    pub fn root(&self) -> &Path {
        &self.snapshot_root
    }

    /// Copy every in-scope file into the mirror.
    ///
    /// A missing monitored root is fatal; individual copy failures are logged
    /// and counted but do not abort the sweep.
    pub fn initialize(&self) -> Result<SweepReport> {
        if !self.monitor_root.is_dir() {
            return Err(Error::Configuration(format!(
                "directory does not exist: {}",
                self.monitor_root.display()
            )));
        }
        fs::create_dir_all(&self.snapshot_root).map_err(|source| Error::SnapshotIo {
            path: self.snapshot_root.clone(),
            source,
        })?;

        info!("Creating snapshot of {:?} in {:?}", self.monitor_root, self.snapshot_root);

        let mut report = SweepReport::default();
        let walker = WalkDir::new(&self.monitor_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.filter.is_internal(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Could not read entry during snapshot: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.filter.matches(entry.path()) {
                continue;
            }

            match self.update(entry.path()) {
                Ok(_) => report.copied += 1,
                Err(e) => {
                    warn!("Could not snapshot {:?}: {}", entry.path(), e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Snapshot complete: {} files copied, {} failed",
            report.copied, report.failed
        );
        Ok(report)
    }

    /// Destroy the mirror and rebuild it from the current tree.
    ///
    /// Callers must have obtained operator confirmation first.
    pub fn refresh(&self) -> Result<SweepReport> {
        if self.snapshot_root.exists() {
            fs::remove_dir_all(&self.snapshot_root).map_err(|source| Error::SnapshotIo {
                path: self.snapshot_root.clone(),
                source,
            })?;
        }
        info!("Cleared snapshot directory {:?}", self.snapshot_root);
        self.initialize()
    }

    /// Where the snapshot of `original` lives. The returned path may not exist.
    ///
    /// `None` when `original` is the root itself or does not stay under it
    /// once `.` and `..` are resolved.
    pub fn lookup(&self, original: &Path) -> Option<PathBuf> {
        let rel = original.strip_prefix(&self.monitor_root).ok()?;
        let rel = normalize_relative(rel)?;
        if rel.as_os_str().is_empty() {
            return None;
        }
        Some(self.snapshot_root.join(rel))
    }

    /// Copy the live content of `original` into its snapshot slot
    pub fn update(&self, original: &Path) -> Result<PathBuf> {
        let slot = self.lookup(original).ok_or_else(|| Error::NoSnapshot {
            path: original.to_path_buf(),
            expected: None,
        })?;

        if let Some(parent) = slot.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::SnapshotIo {
                path: original.to_path_buf(),
                source,
            })?;
        }
        copy_preserving(original, &slot).map_err(|source| Error::SnapshotIo {
            path: original.to_path_buf(),
            source,
        })?;

        debug!("Snapshot updated: {:?} -> {:?}", original, slot);
        Ok(slot)
    }
}

/// Copy file content and permissions, then carry over access and
/// modification times
pub(crate) fn copy_preserving(src: &Path, dst: &Path) -> io::Result<u64> {
    let bytes = fs::copy(src, dst)?;
    let metadata = fs::metadata(src)?;
    filetime::set_file_times(
        dst,
        FileTime::from_last_access_time(&metadata),
        FileTime::from_last_modification_time(&metadata),
    )?;
    Ok(bytes)
}
