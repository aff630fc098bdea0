//! Configuration management for fsguard
//!
//! [`Config`] is what the operator writes (YAML file plus command-line
//! overrides). [`Config::validate`] turns it into [`Settings`], the immutable,
//! fully resolved object every core component is constructed from.

use crate::error::{Error, Result};
use crate::filter::{PathFilter, ScopeFilter};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory tree to monitor
    #[serde(default)]
    pub monitor_root: Option<PathBuf>,

    /// Files to track (basenames or root-relative paths); empty tracks everything
    #[serde(default)]
    pub files: Vec<String>,

    /// Mirror of the monitored files at the last trusted point
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Where timestamped copies are saved on restore
    #[serde(default = "default_duplicates_dir")]
    pub duplicates_dir: PathBuf,

    /// Append-only CSV audit trail
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,

    /// Maximum number of events kept in memory
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Spike detection thresholds
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Audit log behavior
    #[serde(default)]
    pub audit: AuditConfig,

    /// Alert configuration
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor_root: None,
            files: Vec::new(),
            snapshot_dir: default_snapshot_dir(),
            duplicates_dir: default_duplicates_dir(),
            audit_log: default_audit_log(),
            history_limit: default_history_limit(),
            detection: DetectionConfig::default(),
            audit: AuditConfig::default(),
            alerts: AlertConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Configuration for `root` with all tool state kept under `state_dir`
    pub fn with_root(root: impl Into<PathBuf>, state_dir: &Path) -> Self {
        Self {
            monitor_root: Some(root.into()),
            snapshot_dir: state_dir.join("snapshots"),
            duplicates_dir: state_dir.join("duplicates"),
            audit_log: state_dir.join("activity_restore_log.csv"),
            ..Self::default()
        }
    }

    /// Apply command-line overrides on top of the file configuration
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref dir) = overrides.dir {
            self.monitor_root = Some(dir.clone());
        }
        if let Some(ref files) = overrides.files {
            self.files = vec![files.clone()];
        }
        if let Some(ref dir) = overrides.snapshot_dir {
            self.snapshot_dir = dir.clone();
        }
        if let Some(ref dir) = overrides.duplicates_dir {
            self.duplicates_dir = dir.clone();
        }
        if let Some(ref log) = overrides.log {
            self.audit_log = log.clone();
        }
        if let Some(window) = overrides.spike_window {
            self.detection.spike_window_secs = window;
        }
        if let Some(threshold) = overrides.spike_threshold {
            self.detection.spike_threshold = threshold;
        }
        if let Some(cooldown) = overrides.alert_cooldown {
            self.detection.alert_cooldown_secs = cooldown;
        }
    }

    /// Resolve and check everything the core needs
    pub fn validate(&self) -> Result<Settings> {
        let root = self
            .monitor_root
            .as_ref()
            .ok_or_else(|| Error::Configuration("no monitored root configured".into()))?;
        let monitor_root = root.canonicalize().map_err(|e| {
            Error::Configuration(format!("directory does not exist: {} ({})", root.display(), e))
        })?;
        if !monitor_root.is_dir() {
            return Err(Error::Configuration(format!(
                "monitored root is not a directory: {}",
                monitor_root.display()
            )));
        }

        let snapshot_dir = resolve(&self.snapshot_dir)?;
        let duplicates_dir = resolve(&self.duplicates_dir)?;
        let audit_log = resolve(&self.audit_log)?;

        if monitor_root.starts_with(&snapshot_dir) || monitor_root.starts_with(&duplicates_dir) {
            return Err(Error::Configuration(
                "monitored root must not live inside the snapshot or duplicates directory".into(),
            ));
        }
        if snapshot_dir == duplicates_dir {
            return Err(Error::Configuration(
                "snapshot and duplicates directories must differ".into(),
            ));
        }

        let detection = &self.detection;
        let spike_window = seconds("spike window", detection.spike_window_secs)?;
        let alert_cooldown = if detection.alert_cooldown_secs == 0.0 {
            TimeDelta::zero()
        } else {
            seconds("alert cooldown", detection.alert_cooldown_secs)?
        };
        if detection.spike_threshold == 0 {
            return Err(Error::Configuration("spike threshold must be at least 1".into()));
        }
        if self.history_limit == 0 {
            return Err(Error::Configuration("history limit must be at least 1".into()));
        }

        let filter = PathFilter::new(monitor_root.clone(), ScopeFilter::parse(&self.files)?)
            .with_internal(snapshot_dir.clone())
            .with_internal(duplicates_dir.clone())
            .with_internal(audit_log.clone());

        Ok(Settings {
            monitor_root,
            filter,
            snapshot_dir,
            duplicates_dir,
            audit_log,
            spike_window,
            spike_threshold: detection.spike_threshold,
            alert_cooldown,
            history_limit: self.history_limit,
            record_events: self.audit.record_events,
        })
    }
}

/// Validated, immutable configuration consumed by the core
#[derive(Debug, Clone)]
pub struct Settings {
    /// Canonical monitored root
    pub monitor_root: PathBuf,
    /// Scope filter bound to the root, with tool-owned paths excluded
    pub filter: PathFilter,
    pub snapshot_dir: PathBuf,
    pub duplicates_dir: PathBuf,
    pub audit_log: PathBuf,
    pub spike_window: TimeDelta,
    pub spike_threshold: usize,
    pub alert_cooldown: TimeDelta,
    pub history_limit: usize,
    /// Whether every in-scope event gets an audit record
    pub record_events: bool,
}

/// Command-line overrides for the `start` command
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Directory to monitor
    #[arg(short = 'd', long)]
    pub dir: Option<PathBuf>,

    /// Comma-separated files to filter (basenames or relative paths)
    #[arg(short = 'F', long)]
    pub files: Option<String>,

    /// Where snapshots are stored
    #[arg(long)]
    pub snapshot_dir: Option<PathBuf>,

    /// Where duplicates are stored when restoring
    #[arg(long)]
    pub duplicates_dir: Option<PathBuf>,

    /// CSV audit log file
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Seconds window to detect a modification spike
    #[arg(long)]
    pub spike_window: Option<f64>,

    /// Number of modifications in the window that triggers an alert
    #[arg(long)]
    pub spike_threshold: Option<usize>,

    /// Seconds to wait before re-alerting after a spike
    #[arg(long)]
    pub alert_cooldown: Option<f64>,
}

/// Spike detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Sliding window length in seconds
    #[serde(default = "default_spike_window")]
    pub spike_window_secs: f64,

    /// Modifications within the window that trigger an alert
    #[serde(default = "default_spike_threshold")]
    pub spike_threshold: usize,

    /// Minimum seconds between two alerts
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_secs: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            spike_window_secs: default_spike_window(),
            spike_threshold: default_spike_threshold(),
            alert_cooldown_secs: default_alert_cooldown(),
        }
    }
}

/// Audit log behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Record every in-scope filesystem event, not only operator actions
    #[serde(default = "default_true")]
    pub record_events: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            record_events: true,
        }
    }
}

/// Alert configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Enable desktop notifications
    #[serde(default = "default_true")]
    pub desktop: bool,

    /// Webhook URL for alerts
    pub webhook: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            desktop: true,
            webhook: None,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// PID file path
    #[serde(default = "default_pid_path")]
    pub pid_file: PathBuf,

    /// Socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,

    /// Log file path
    #[serde(default = "default_log_path")]
    pub log_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_path(),
            socket: default_socket_path(),
            log_file: default_log_path(),
        }
    }
}

/// Absolute form of a possibly relative, possibly not yet existing path
fn resolve(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    std::path::absolute(path)
        .map_err(|e| Error::Configuration(format!("cannot resolve {}: {}", path.display(), e)))
}

fn seconds(what: &str, secs: f64) -> Result<TimeDelta> {
    if !secs.is_finite() || secs <= 0.0 || secs > 86_400.0 * 365.0 {
        return Err(Error::Configuration(format!(
            "{} must be a positive number of seconds, got {}",
            what, secs
        )));
    }
    Ok(TimeDelta::milliseconds((secs * 1000.0).round() as i64))
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("/var/lib/fsguard/snapshots")
}

fn default_duplicates_dir() -> PathBuf {
    PathBuf::from("/var/lib/fsguard/duplicates")
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("/var/lib/fsguard/activity_restore_log.csv")
}

fn default_history_limit() -> usize {
    10_000
}

fn default_spike_window() -> f64 {
    5.0
}

fn default_spike_threshold() -> usize {
    8
}

fn default_alert_cooldown() -> f64 {
    60.0
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("/run/fsguard.pid")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/fsguard.sock")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/fsguard.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.monitor_root.is_none());
        assert_eq!(config.detection.spike_threshold, 8);
        assert_eq!(config.detection.spike_window_secs, 5.0);
        assert_eq!(config.detection.alert_cooldown_secs, 60.0);
    }

    #[test]
    fn test_missing_root_is_configuration_error() {
        let state = tempdir().unwrap();
        let config = Config::with_root(state.path().join("does-not-exist"), state.path());
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        assert!(matches!(Config::default().validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_resolves_settings() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let mut config = Config::with_root(root.path(), state.path());
        config.files = vec!["a.txt, docs/b.txt".into()];

        let settings = config.validate().unwrap();
        assert_eq!(settings.monitor_root, root.path().canonicalize().unwrap());
        assert_eq!(settings.spike_window, TimeDelta::seconds(5));
        assert_eq!(settings.alert_cooldown, TimeDelta::seconds(60));
        assert!(!settings.filter.scope().is_unrestricted());
        assert!(settings.filter.matches(&settings.monitor_root.join("docs/b.txt")));
    }

    #[test]
    fn test_bad_thresholds_rejected() {
        let root = tempdir().unwrap();
        let mut config = Config::with_root(root.path(), root.path());
        config.detection.spike_threshold = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = Config::with_root(root.path(), root.path());
        config.detection.spike_window_secs = -1.0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_bad_filter_is_filter_error() {
        let root = tempdir().unwrap();
        let mut config = Config::with_root(root.path(), root.path());
        config.files = vec!["../escape.txt".into()];
        assert!(matches!(config.validate(), Err(Error::FilterParse { .. })));
    }

    #[test]
    fn test_overrides_and_yaml() {
        let yaml = "monitor_root: /srv/share\nfiles: [a.txt]\ndetection:\n  spike_threshold: 3\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.detection.spike_threshold, 3);
        assert_eq!(config.detection.spike_window_secs, 5.0);

        config.apply(&ConfigOverrides {
            files: Some("b.txt,c.txt".into()),
            spike_threshold: Some(12),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.files, vec!["b.txt,c.txt".to_string()]);
        assert_eq!(config.detection.spike_threshold, 12);
        assert_eq!(config.monitor_root, Some(PathBuf::from("/srv/share")));
    }

    #[test]
    fn test_state_inside_root_is_internal() {
        let root = tempdir().unwrap();
        let config = Config::with_root(root.path(), &root.path().join(".fsguard"));
        let settings = config.validate().unwrap();
        let snap = settings.snapshot_dir.join("a.txt");
        assert!(!settings.filter.matches(&snap));
        assert!(settings.filter.matches(&settings.monitor_root.join("a.txt")));
    }
}
