//! Resynchronizes a damaged partition from its healthy twin.

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::{
    AbManager, Error, Result, Slot, SystemState,
    health::{MIN_REPAIR_SOURCE_SCORE, VERIFIED_SCORE},
    mount::MountMode,
    state::StateLock,
    tree::{self, MirrorStats},
};

pub mod job;

use job::RepairJob;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    pub target: Slot,
    pub source: Slot,
    pub score: u8,
    pub stats: MirrorStats,
}

impl AbManager {
    /// Mirrors the other slot onto `target` and verifies the result.
    ///
    /// The caller holds the lock for the whole duration, so no swap can happen
    /// while `target` is half written. Returns the committed state.
    #[instrument(skip(self, lock, state))]
    pub fn repair_locked(
        &self,
        lock: &StateLock,
        state: &SystemState,
        target: Slot,
    ) -> Result<(SystemState, RepairOutcome)> {
        if target == state.active {
            return Err(Error::RepairTargetActive(target));
        }
        let source = target.opposite();

        let source_report = self.evaluate(source, state);
        if source_report.score < MIN_REPAIR_SOURCE_SCORE {
            error!("refusing to repair from slot {source}: {source_report}");
            return Err(Error::InsufficientStandbyHealth {
                slot: source,
                score: source_report.score,
                required: MIN_REPAIR_SOURCE_SCORE,
            });
        }

        let mounter = self.evaluator.mounter();
        let src = mounter.mount(&self.settings.partition(source), MountMode::ReadOnly)?;
        let dst = mounter.mount(&self.settings.partition(target), MountMode::ReadWrite)?;
        info!(
            "mirroring slot {source} ({}) onto slot {target} ({})",
            src.root().display(),
            dst.root().display()
        );
        let mirrored = tree::mirror(src.root(), dst.root(), &self.excludes);
        drop(dst);
        drop(src);

        // The target is always the standby; any update staged there is gone.
        let mut next = state.clone();
        next.update_pending = false;

        let stats = match mirrored {
            Ok(stats) => stats,
            Err(e) => {
                let report = self.evaluate(target, state);
                next.record_health(&report);
                lock.commit(&next)?;
                error!("failed to mirror slot {source} onto slot {target}: {e:#}");
                return Err(e.into());
            }
        };
        info!(
            "mirrored {} entries, {} unchanged, {} removed",
            stats.copied, stats.unchanged, stats.removed
        );

        let report = self.evaluate(target, state);
        next.record_health(&report);

        if report.score <= VERIFIED_SCORE {
            lock.commit(&next)?;
            error!("repair of slot {target} did not verify: {report}");
            return Err(Error::RepairVerificationFailed {
                slot: target,
                score: report.score,
            });
        }

        next.partition_mut(target).version = state
            .partition(source)
            .version
            .clone()
            .or(source_report.manifest_version);
        lock.commit(&next)?;
        self.repairs.remove(target)?;
        info!("slot {target} repaired from slot {source}: {report}");

        Ok((
            next,
            RepairOutcome {
                target,
                source,
                score: report.score,
                stats,
            },
        ))
    }

    /// Schedules and immediately runs a repair of `target`.
    ///
    /// The marker stays behind when the repair fails, so the repair service retries.
    pub fn request_repair(&self, target: Slot) -> Result<RepairOutcome> {
        let lock = self.store.lock()?;
        let state = self.load(&lock)?;
        if target == state.active {
            return Err(Error::RepairTargetActive(target));
        }
        self.repairs
            .schedule(&RepairJob::new(target, "requested by operator"))?;
        self.repair_locked(&lock, &state, target)
            .map(|(_, outcome)| outcome)
    }

    /// Works through all pending repair markers.
    ///
    /// Markers for the active slot are left alone: that slot is repaired once a
    /// failover has demoted it.
    pub fn run_pending_repairs(&self) -> Result<Vec<(Slot, Result<RepairOutcome>)>> {
        let lock = self.store.lock()?;
        let mut state = self.load(&lock)?;
        let mut results = Vec::new();

        for job in self.repairs.pending() {
            if job.target == state.active {
                warn!(
                    "skipping repair of active slot {} ({}); it runs after the next failover",
                    job.target, job.reason
                );
                continue;
            }
            info!("running repair of slot {} scheduled at {}", job.target, job.scheduled_at);
            let result = match self.repair_locked(&lock, &state, job.target) {
                Ok((next, outcome)) => {
                    state = next;
                    Ok(outcome)
                }
                Err(e) => {
                    error!("repair of slot {} failed: {e}", job.target);
                    Err(e)
                }
            };
            results.push((job.target, result));
        }

        Ok(results)
    }
}
