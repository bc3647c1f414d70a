use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    AbManager, Result, Slot, SystemState,
    failover::SwapKind,
    health::{HEALTHY_SCORE, MIN_FAILOVER_SCORE},
    repair::job::RepairJob,
    state::StateLock,
};

/// Result of one boot check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BootOutcome {
    /// The active slot is healthy and the boot has been confirmed.
    HealthyContinue { score: u8 },
    /// The active slot is usable but degraded; a repair job was written for it.
    ScheduleRepair { score: u8 },
    /// A repair or failover was called for but is disabled by policy.
    Degraded { score: Option<u8>, reason: String },
    /// The standby took over; the system must reboot into it.
    Failover { from: Slot, to: Slot, reason: String },
}

impl BootOutcome {
    /// Whether the system should keep running on the current slot.
    pub fn proceed(&self) -> bool {
        !matches!(self, BootOutcome::Failover { .. })
    }
}

impl AbManager {
    /// Runs once per boot.
    ///
    /// The boot failure counter is incremented and persisted before anything else,
    /// so a crash during the check still counts as a failed boot.
    #[instrument(skip(self))]
    pub fn boot_check(&self) -> Result<BootOutcome> {
        let lock = self.store.lock()?;
        let mut state = self.load(&lock)?;

        state.boot_failure_count = state.boot_failure_count.saturating_add(1);
        lock.commit(&state)?;
        info!(
            "boot check of slot {} (attempt {})",
            state.active, state.boot_failure_count
        );

        let max = self.settings.max_boot_attempts;
        if state.boot_failure_count > max {
            let reason = format!(
                "{} unconfirmed boots exceed the maximum of {max}",
                state.boot_failure_count
            );
            return self.fail_over_at_boot(&lock, &state, None, reason);
        }

        let report = self.evaluate(state.active, &state);
        let score = report.score;
        state.record_health(&report);

        // A failover commits the score along with the swap; a refused one leaves
        // only the counter increment behind.
        if score < MIN_FAILOVER_SCORE {
            let reason = format!("active slot scored {score}");
            return self.fail_over_at_boot(&lock, &state, Some(score), reason);
        }
        lock.commit(&state)?;

        if score > HEALTHY_SCORE {
            let active = state.active;
            state.boot_failure_count = 0;
            state.last_successful_boot = Some(Utc::now());
            state.partition_mut(active).health = 100;
            lock.commit(&state)?;
            if let Err(e) = self.bootloader.mark_boot_successful(active) {
                warn!("bootloader did not accept boot confirmation: {e:#}");
            }
            info!("boot of slot {active} confirmed with score {score}");
            return Ok(BootOutcome::HealthyContinue { score });
        }

        if state.auto_repair_enabled {
            self.repairs.schedule(&RepairJob::new(
                state.active,
                format!("booted with degraded health score {score}"),
            ))?;
            Ok(BootOutcome::ScheduleRepair { score })
        } else {
            warn!("slot {} is degraded ({score}) and auto repair is off", state.active);
            Ok(BootOutcome::Degraded {
                score: Some(score),
                reason: "auto repair disabled".to_owned(),
            })
        }
    }

    fn fail_over_at_boot(
        &self,
        lock: &StateLock,
        state: &SystemState,
        score: Option<u8>,
        reason: String,
    ) -> Result<BootOutcome> {
        if !state.failover_enabled {
            lock.commit(state)?;
            warn!("failover needed ({reason}) but disabled by policy");
            return Ok(BootOutcome::Degraded {
                score,
                reason: format!("failover disabled: {reason}"),
            });
        }

        warn!("failing over: {reason}");
        let next = self.swap(lock, state, SwapKind::Failover)?;
        Ok(BootOutcome::Failover {
            from: state.active,
            to: next.active,
            reason,
        })
    }
}
