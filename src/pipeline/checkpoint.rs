//! Resumable progress records.
//!
//! Two artifacts are kept next to each other:
//!
//! - the checkpoint (`{entities_completed, completed_units, units_in_progress, timestamp}`),
//!   small and human-readable;
//! - one accumulator snapshot for the unit in progress, holding the running
//!   totals at the recorded cursor so a resumed unit continues exactly where
//!   the last batch ended.
//!
//! Both are written whole to a temporary file and renamed into place.

use crate::accumulate::StreamingAccumulator;
use crate::data::report::{read_json, write_json_atomic};
use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Run-level progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Entities fully accumulated in the unit in progress.
    pub entities_completed: usize,
    pub completed_units: Vec<u32>,
    #[serde(default)]
    pub units_in_progress: Vec<u32>,
    /// RFC 3339 time of the last write.
    pub timestamp: String,
}

impl Checkpoint {
    /// Read a checkpoint, or `None` if the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        read_json(path).map(Some)
    }

    /// Stamp and write.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.timestamp = Utc::now().to_rfc3339();
        write_json_atomic(path, self)
    }

    pub fn is_completed(&self, unit: u32) -> bool {
        self.completed_units.contains(&unit)
    }

    pub fn is_in_progress(&self, unit: u32) -> bool {
        self.units_in_progress.contains(&unit)
    }

    /// Record that a unit has started, resetting the cursor if it is new.
    pub fn mark_in_progress(&mut self, unit: u32) {
        if !self.is_in_progress(unit) {
            self.units_in_progress.push(unit);
            self.entities_completed = 0;
        }
    }

    /// Move a unit from in-progress to completed.
    pub fn mark_completed(&mut self, unit: u32) {
        let was_running = self.is_in_progress(unit);
        self.units_in_progress.retain(|&u| u != unit);
        if !self.is_completed(unit) {
            self.completed_units.push(unit);
            self.completed_units.sort_unstable();
        }
        if was_running {
            self.entities_completed = 0;
        }
    }
}

/// Accumulator state of one unit at an entity cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorSnapshot {
    pub unit: u32,
    /// Entities `0..entities_completed` are fully contained in `accumulator`.
    pub entities_completed: usize,
    pub accumulator: StreamingAccumulator,
}

impl AccumulatorSnapshot {
    /// Read a snapshot, or `None` if the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        read_json(path).map(Some)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Snapshot file of a unit, derived from the checkpoint path.
pub fn snapshot_path(checkpoint: &Path, unit: u32) -> PathBuf {
    let mut name = checkpoint.as_os_str().to_owned();
    name.push(format!(".unit{:02}.acc.json", unit));
    PathBuf::from(name)
}

/// Delete a file if present.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
