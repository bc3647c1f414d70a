//! Composite health scoring of a partition.
//!
//! The score is the weighted sum of four sub-scores, each in `0..=100`:
//!
//! | check          | weight |
//! |----------------|--------|
//! | filesystem     | 30     |
//! | critical files | 30     |
//! | checksum       | 20     |
//! | disk           | 20     |
//!
//! When the evaluated partition is the active one, `boot_failure_count * 10` is
//! subtracted from the weighted sum before clamping to `0..=100`.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    Result,
    mount::{MountMode, Mounter},
    partition::Partition,
};

pub mod checks;
pub mod manifest;

pub use checks::{DiskHealth, DiskHealthProbe, FilesystemChecker, FsVerdict};
use manifest::Manifest;

const WEIGHT_FILESYSTEM: u32 = 30;
const WEIGHT_CRITICAL_FILES: u32 = 30;
const WEIGHT_CHECKSUM: u32 = 20;
const WEIGHT_DISK: u32 = 20;

const MISSING_FILE_DEDUCTION: u32 = 20;
const BOOT_FAILURE_PENALTY: u32 = 10;

/// Below this, a partition is never booted into or failed over to.
pub const MIN_FAILOVER_SCORE: u8 = 50;
/// Above this, a boot is considered successful.
pub const HEALTHY_SCORE: u8 = 80;
/// A repair source must score at least this.
pub const MIN_REPAIR_SOURCE_SCORE: u8 = 80;
/// Repaired or freshly updated partitions must score above this.
pub const VERIFIED_SCORE: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubScores {
    pub filesystem: u8,
    pub critical_files: u8,
    pub checksum: u8,
    pub disk: u8,
}

impl SubScores {
    fn weighted(&self) -> u32 {
        (WEIGHT_FILESYSTEM * u32::from(self.filesystem)
            + WEIGHT_CRITICAL_FILES * u32::from(self.critical_files)
            + WEIGHT_CHECKSUM * u32::from(self.checksum)
            + WEIGHT_DISK * u32::from(self.disk))
            / 100
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub slot: crate::Slot,
    pub score: u8,
    pub sub_scores: SubScores,
    pub penalty: u32,
    pub anomalies: Vec<String>,
    pub manifest_digest: Option<String>,
    pub manifest_version: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.sub_scores;
        write!(
            f,
            "slot {}: {} (fs {}, files {}, checksum {}, disk {}, penalty {})",
            self.slot,
            self.score,
            s.filesystem,
            s.critical_files,
            s.checksum,
            s.disk,
            self.penalty
        )
    }
}

pub fn composite_score(sub_scores: &SubScores, penalty: u32) -> u8 {
    let score = sub_scores.weighted().saturating_sub(penalty).min(100);
    u8::try_from(score).unwrap_or(100)
}

#[derive(Debug, Clone)]
pub struct HealthEvaluator {
    mounter: Arc<dyn Mounter>,
    fs_checker: Arc<dyn FilesystemChecker>,
    disk_probe: Arc<dyn DiskHealthProbe>,
    critical_files: Vec<PathBuf>,
    manifest_path: PathBuf,
}

impl HealthEvaluator {
    pub fn new(
        mounter: Arc<dyn Mounter>,
        fs_checker: Arc<dyn FilesystemChecker>,
        disk_probe: Arc<dyn DiskHealthProbe>,
        critical_files: Vec<PathBuf>,
        manifest_path: PathBuf,
    ) -> Self {
        Self {
            mounter,
            fs_checker,
            disk_probe,
            critical_files,
            manifest_path,
        }
    }

    pub fn mounter(&self) -> &Arc<dyn Mounter> {
        &self.mounter
    }

    /// Scores `partition`. Never fails: checks that can't run score 0 and are
    /// reported as anomalies. Pass the current boot failure count only when
    /// `partition` is the active one.
    #[instrument(skip_all, fields(slot = %partition.slot))]
    pub fn evaluate(&self, partition: &Partition, boot_failure_count: u32) -> HealthReport {
        let mut anomalies = Vec::new();

        let filesystem = match retry_once(|| self.fs_checker.check(partition)) {
            Ok(FsVerdict::Clean) => 100,
            Ok(FsVerdict::Damaged(reason)) => {
                anomalies.push(reason);
                0
            }
            Err(e) => {
                anomalies.push(e.to_string());
                0
            }
        };

        let disk = match retry_once(|| self.disk_probe.probe(&partition.disk)) {
            Ok(health) => {
                if health != DiskHealth::Healthy {
                    anomalies.push(format!(
                        "disk {} is {health:?}",
                        partition.disk.display()
                    ));
                }
                health.score()
            }
            Err(e) => {
                anomalies.push(e.to_string());
                0
            }
        };

        let mut critical_files = 0;
        let mut checksum = 0;
        let mut manifest_digest = None;
        let mut manifest_version = None;
        match self.mounter.mount(partition, MountMode::ReadOnly) {
            Ok(guard) => {
                critical_files = self.check_critical_files(guard.root(), &mut anomalies);
                match Manifest::load(guard.root(), &self.manifest_path) {
                    Ok(loaded) => {
                        let problems = loaded.manifest.verify(guard.root());
                        checksum = if problems.is_empty() { 100 } else { 0 };
                        anomalies.extend(problems);
                        manifest_digest = Some(loaded.digest);
                        manifest_version = Some(loaded.manifest.version);
                    }
                    Err(e) => anomalies.push(format!("{e:#}")),
                }
            }
            Err(e) => anomalies.push(format!(
                "failed to mount slot {}: {e}",
                partition.slot
            )),
        }

        let sub_scores = SubScores {
            filesystem,
            critical_files,
            checksum,
            disk,
        };
        let penalty = boot_failure_count.saturating_mul(BOOT_FAILURE_PENALTY);
        let report = HealthReport {
            slot: partition.slot,
            score: composite_score(&sub_scores, penalty),
            sub_scores,
            penalty,
            anomalies,
            manifest_digest,
            manifest_version,
            evaluated_at: Utc::now(),
        };

        if report.anomalies.is_empty() {
            info!("{report}");
        } else {
            warn!("{report}; anomalies: {:?}", report.anomalies);
        }
        report
    }

    fn check_critical_files(&self, root: &Path, anomalies: &mut Vec<String>) -> u8 {
        let missing: Vec<_> = self
            .critical_files
            .iter()
            .filter(|rel| {
                root.join(manifest::strip_root(rel))
                    .symlink_metadata()
                    .is_err()
            })
            .collect();
        for rel in &missing {
            anomalies.push(format!("critical file {} is missing", rel.display()));
        }
        let deduction = u32::try_from(missing.len())
            .unwrap_or(u32::MAX)
            .saturating_mul(MISSING_FILE_DEDUCTION);
        u8::try_from(100u32.saturating_sub(deduction)).unwrap_or(0)
    }
}

/// Transient failures get one more chance.
fn retry_once<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    f().or_else(|e| {
        warn!("{e}; retrying once");
        f()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(filesystem: u8, critical_files: u8, checksum: u8, disk: u8) -> SubScores {
        SubScores {
            filesystem,
            critical_files,
            checksum,
            disk,
        }
    }

    #[test]
    fn weights_add_up() {
        assert_eq!(composite_score(&sub(100, 100, 100, 100), 0), 100);
        assert_eq!(composite_score(&sub(0, 0, 0, 0), 0), 0);
        assert_eq!(composite_score(&sub(100, 100, 0, 100), 0), 80);
        assert_eq!(composite_score(&sub(0, 100, 100, 100), 0), 70);
        assert_eq!(composite_score(&sub(100, 80, 100, 50), 0), 84);
    }

    #[test]
    fn penalty_is_subtracted_and_clamped() {
        assert_eq!(composite_score(&sub(100, 100, 100, 100), 30), 70);
        assert_eq!(composite_score(&sub(0, 100, 0, 0), 40), 0);
    }
}
