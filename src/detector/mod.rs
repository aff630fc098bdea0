//! Spike detection module

pub mod spike;

pub use spike::SpikeDetector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A modification burst that crossed the spike threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Alert id, increasing per detector
    pub id: u64,
    /// When the alert fired
    pub raised_at: DateTime<Utc>,
    /// Modifications in the window at that moment
    pub count: usize,
    /// Distinct paths in the window, first-seen order
    pub paths: Vec<PathBuf>,
}
