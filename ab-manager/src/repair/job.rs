//! On-disk markers recording the intent to resynchronize a partition.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Result, Slot, state::write_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairJob {
    pub target: Slot,
    pub reason: String,
    pub scheduled_at: DateTime<Utc>,
}

impl RepairJob {
    pub fn new(target: Slot, reason: impl Into<String>) -> Self {
        Self {
            target,
            reason: reason.into(),
            scheduled_at: Utc::now(),
        }
    }
}

/// Directory of `repair-<slot>.json` markers. At most one marker per slot.
#[derive(Debug, Clone)]
pub struct RepairQueue {
    dir: PathBuf,
}

impl RepairQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn marker_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("repair-{slot}.json"))
    }

    /// Writes (or replaces) the marker for `job.target`.
    pub fn schedule(&self, job: &RepairJob) -> Result<()> {
        let contents = serde_json::to_vec_pretty(job)
            .map_err(|e| eyre::eyre!("failed to serialize repair job: {e}"))?;
        write_atomic(&self.marker_path(job.target), &contents)?;
        info!("scheduled repair of slot {}: {}", job.target, job.reason);
        Ok(())
    }

    pub fn get(&self, slot: Slot) -> Result<Option<RepairJob>> {
        read_marker(&self.marker_path(slot))
    }

    /// Pending jobs, in slot order. Unreadable markers are skipped.
    pub fn pending(&self) -> Vec<RepairJob> {
        Slot::ALL
            .into_iter()
            .filter_map(|slot| match self.get(slot) {
                Ok(job) => job,
                Err(e) => {
                    warn!("ignoring unreadable repair marker for slot {slot}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Deletes the marker for `slot`, if any.
    pub fn remove(&self, slot: Slot) -> Result<()> {
        match fs::remove_file(self.marker_path(slot)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_marker(path: &Path) -> Result<Option<RepairJob>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let job = serde_json::from_slice(&raw)
        .map_err(|e| eyre::eyre!("failed to parse repair marker {path:?}: {e}"))?;
    Ok(Some(job))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_keyed_by_slot() {
        let dir = tempfile::tempdir().unwrap();
        let queue = RepairQueue::new(dir.path().join("repair"));
        assert!(queue.pending().is_empty());

        let job = RepairJob::new(Slot::B, "demoted by failover");
        queue.schedule(&job).unwrap();
        queue.schedule(&RepairJob::new(Slot::B, "again")).unwrap();

        assert!(dir.path().join("repair/repair-b.json").exists());
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].reason, "again");

        queue.remove(Slot::B).unwrap();
        queue.remove(Slot::B).unwrap();
        assert_eq!(queue.get(Slot::B).unwrap(), None);
    }

    #[test]
    fn garbage_markers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = RepairQueue::new(dir.path());
        fs::write(queue.marker_path(Slot::A), b"nope").unwrap();
        queue.schedule(&RepairJob::new(Slot::B, "x")).unwrap();

        assert!(queue.get(Slot::A).is_err());
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, Slot::B);
    }
}
