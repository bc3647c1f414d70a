//! The slot swap transaction shared by failover, update activation and rollback.

use std::thread;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::{
    AbManager, Error, Result, Slot, SystemState,
    health::MIN_FAILOVER_SCORE,
    repair::job::RepairJob,
    state::StateLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapKind {
    /// The active slot is unhealthy; the demoted slot gets a repair job.
    Failover,
    /// A staged update becomes active.
    Activation,
    /// Return to the previously active slot.
    Rollback,
}

impl SwapKind {
    fn requires_live_check(self) -> bool {
        match self {
            SwapKind::Failover | SwapKind::Rollback => true,
            // The update was verified when it was staged.
            SwapKind::Activation => false,
        }
    }
}

impl AbManager {
    /// Swaps active and standby. Nothing is persisted unless every step succeeds:
    /// the bootloader is switched first, then the repair marker (failover only) is
    /// written, and only then the new state is committed. Failures undo the earlier
    /// steps.
    #[instrument(skip_all, fields(?kind, from = %state.active))]
    pub(crate) fn swap(
        &self,
        lock: &StateLock,
        state: &SystemState,
        kind: SwapKind,
    ) -> Result<SystemState> {
        let demoted = state.active;
        let promoted = state.standby;
        let mut next = state.clone();

        if kind.requires_live_check() {
            let report = self.evaluate(promoted, state);
            if report.score < MIN_FAILOVER_SCORE {
                error!("refusing to switch to slot {promoted}: {report}");
                return Err(Error::InsufficientStandbyHealth {
                    slot: promoted,
                    score: report.score,
                    required: MIN_FAILOVER_SCORE,
                });
            }
            next.record_health(&report);
        }

        next.active = promoted;
        next.standby = demoted;
        next.boot_failure_count = 0;
        // A staged update lives on the standby; once the slots trade places it is
        // either running or no longer the standby's.
        next.update_pending = false;
        next.rollback_available = match kind {
            SwapKind::Failover | SwapKind::Activation => true,
            SwapKind::Rollback => false,
        };

        self.set_boot_target_with_retry(promoted)?;

        let previous_job = if kind == SwapKind::Failover {
            let previous = self.repairs.get(demoted).ok().flatten();
            let job = RepairJob::new(demoted, "demoted by failover");
            if let Err(e) = self.repairs.schedule(&job) {
                error!("failed to schedule repair of slot {demoted}: {e}");
                self.restore_boot_target(demoted);
                return Err(e);
            }
            Some(previous)
        } else {
            None
        };

        if let Err(e) = lock.commit(&next) {
            error!("failed to commit swap to slot {promoted}: {e}");
            if let Some(previous) = previous_job {
                let restored = match previous {
                    Some(job) => self.repairs.schedule(&job),
                    None => self.repairs.remove(demoted),
                };
                if let Err(e) = restored {
                    warn!("failed to restore repair marker of slot {demoted}: {e}");
                }
            }
            self.restore_boot_target(demoted);
            return Err(e);
        }

        info!("slot {promoted} is now active, slot {demoted} is standby");
        Ok(next)
    }

    /// Failover transaction for callers that already hold the lock.
    pub fn failover_locked(
        &self,
        lock: &StateLock,
        state: &SystemState,
    ) -> Result<SystemState> {
        self.swap(lock, state, SwapKind::Failover)
    }

    /// Operator-initiated failover to the standby slot.
    pub fn failover(&self) -> Result<SystemState> {
        let lock = self.store.lock()?;
        let state = self.load(&lock)?;
        self.failover_locked(&lock, &state)
    }

    fn set_boot_target_with_retry(&self, slot: Slot) -> Result<()> {
        let attempts = self.settings.bootloader_retries;
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.bootloader.set_boot_target(slot) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("attempt {attempt}/{attempts} to set boot target {slot} failed: {e:#}");
                    reason = format!("{e:#}");
                }
            }
            if attempt < attempts {
                thread::sleep(self.settings.bootloader_retry_delay);
            }
        }

        Err(Error::BootloaderUpdateFailed {
            slot,
            attempts,
            reason,
        })
    }

    fn restore_boot_target(&self, slot: Slot) {
        if let Err(e) = self.set_boot_target_with_retry(slot) {
            error!("bootloader may now point at the wrong slot: {e}");
        }
    }
}
