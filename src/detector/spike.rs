//! Modification spike detection
//!
//! Normal users save a handful of files per minute; mass-encryption touches
//! dozens per second. The detector keeps a sliding window of recent
//! modifications and raises an alert when the window holds at least
//! `threshold` entries, at most once per cooldown period.

use super::AlertPayload;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sliding-window spike detector
#[derive(Debug)]
pub struct SpikeDetector {
    /// Window length
    window: TimeDelta,
    /// Entries in the window that trigger an alert
    threshold: usize,
    /// Minimum time between alerts
    cooldown: TimeDelta,
    /// `(timestamp, path)` pairs, sorted by timestamp
    entries: VecDeque<(DateTime<Utc>, PathBuf)>,
    /// When the last alert fired
    last_alert_at: Option<DateTime<Utc>>,
    /// Id for the next alert
    next_alert_id: u64,
}

impl SpikeDetector {
    /// Create a new detector
    pub fn new(window: TimeDelta, threshold: usize, cooldown: TimeDelta) -> Self {
        Self {
            window,
            threshold,
            cooldown,
            entries: VecDeque::new(),
            last_alert_at: None,
            next_alert_id: 1,
        }
    }

    /// Record a modification observed now
    pub fn record_modification(&mut self, path: &Path) {
        self.record_modification_at(path, Utc::now());
    }

    /// Record a modification observed at `at`.
    ///
    /// A timestamp older than the newest entry (wall clock stepped back) is
    /// clamped to that entry so the window stays sorted.
    pub fn record_modification_at(&mut self, path: &Path, at: DateTime<Utc>) {
        let at = match self.entries.back() {
            Some((newest, _)) if at < *newest => {
                debug!("Clock went backwards ({} < {}), clamping", at, newest);
                *newest
            }
            _ => at,
        };
        self.entries.push_back((at, path.to_path_buf()));
        self.prune(at);
    }

    /// Drop entries older than `now - window`
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while let Some((oldest, _)) = self.entries.front() {
            if *oldest >= cutoff {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// Number of modifications currently retained
    pub fn count_in_window(&self) -> usize {
        self.entries.len()
    }

    /// Raise an alert if the window is over threshold and the cooldown has passed
    pub fn maybe_trigger(&mut self) -> Option<AlertPayload> {
        self.maybe_trigger_at(Utc::now())
    }

    /// [`maybe_trigger`](Self::maybe_trigger) evaluated at `now`
    pub fn maybe_trigger_at(&mut self, now: DateTime<Utc>) -> Option<AlertPayload> {
        self.prune(now);

        let count = self.count_in_window();
        if count < self.threshold {
            return None;
        }
        if let Some(last) = self.last_alert_at {
            if now - last <= self.cooldown {
                return None;
            }
        }

        self.last_alert_at = Some(now);
        let id = self.next_alert_id;
        self.next_alert_id += 1;

        Some(AlertPayload {
            id,
            raised_at: now,
            count,
            paths: self.recent_paths(),
        })
    }

    /// Distinct paths in the window, in first-seen order
    pub fn recent_paths(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|(_, p)| seen.insert(p.as_path()))
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// When the last alert fired
    pub fn last_alert_at(&self) -> Option<DateTime<Utc>> {
        self.last_alert_at
    }
}
