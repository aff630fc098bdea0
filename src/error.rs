//! Error taxonomy for the monitoring core

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the monitoring core.
///
/// Per-file and per-event variants are caught at the operation boundary and
/// reported to the operator; only the variants for which [`Error::is_fatal`]
/// returns `true` are allowed to halt the processing loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unusable configuration (e.g. missing monitored root)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A scope filter token could not be parsed
    #[error("invalid scope filter token {token:?}: {reason}")]
    FilterParse { token: String, reason: String },

    /// Copying a file into its snapshot slot failed
    #[error("snapshot copy failed for {}: {source}", path.display())]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// There is no usable snapshot for the path
    #[error("no snapshot found for {}", path.display())]
    NoSnapshot {
        path: PathBuf,
        /// Where the snapshot was expected, if the path is inside the monitored root
        expected: Option<PathBuf>,
    },

    /// Restoring the snapshot over the live file failed
    #[error("restore failed for {}: {source}", path.display())]
    RestoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The restore succeeded but the duplicate could not be saved
    #[error("duplicate save failed for {}: {source}", path.display())]
    DuplicateSave {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The audit log could not be written
    #[error("audit log write failed ({}): {source}", path.display())]
    AuditWrite {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// The filesystem watcher stopped; monitoring is no longer live
    #[error("filesystem watcher failed: {0}")]
    Watcher(String),
}

impl Error {
    /// Whether this error must halt the system rather than be reported per file
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::FilterParse { .. }
                | Error::AuditWrite { .. }
                | Error::Watcher(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
