//! Supervision of the two redundant system partitions of the Orb.
//!
//! [`AbManager`] owns the persisted [`SystemState`] and exposes every operation
//! that changes it:
//!
//! * [`AbManager::boot_check`] runs once per boot, scores the active partition and
//!   either confirms the boot, schedules a repair, or fails over to the standby.
//! * [`AbManager::request_repair`] and [`AbManager::run_pending_repairs`]
//!   resynchronize a damaged partition from its healthy twin.
//! * [`AbManager::apply_update`], [`AbManager::activate_update`] and
//!   [`AbManager::rollback`] stage an image on the standby, switch to it, and
//!   switch back.
//!
//! All mutations happen under the state lock, and a slot swap is only persisted
//! once the bootloader has been pointed at the new active slot.

use std::sync::Arc;

use bon::bon;
use serde::Serialize;
use tracing::{info, warn};

pub mod bootloader;
pub mod dbus;
pub mod efivar;
mod error;
pub mod failover;
pub mod health;
pub mod mount;
pub mod partition;
pub mod program;
pub mod repair;
pub mod settings;
pub mod shell;
mod slot;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod test_utils;
pub mod tree;
pub mod update;
mod util;

pub use error::{Error, Result};
pub use settings::{Args, Settings};
pub use slot::{Slot, SlotParseError};
pub use state::{StateStore, SystemState};
pub use supervisor::BootOutcome;

use crate::{
    bootloader::{BootloaderDriver, EfiBootChain, GrubEnv},
    health::{
        DiskHealthProbe, FilesystemChecker, HealthEvaluator, HealthReport,
        checks::{Fsck, Smartctl},
    },
    mount::{Mounter, Passthrough, SysMounter},
    repair::job::{RepairJob, RepairQueue},
    settings::{BootloaderKind, MounterKind},
    shell::{Host, Shell},
    state::StateLock,
    tree::Excludes,
};

/// What the GUI and `status` show.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: SystemState,
    pub pending_repairs: Vec<RepairJob>,
}

#[derive(Debug)]
pub struct AbManager {
    settings: Settings,
    store: StateStore,
    repairs: RepairQueue,
    evaluator: HealthEvaluator,
    bootloader: Arc<dyn BootloaderDriver>,
    excludes: Excludes,
}

#[bon]
impl AbManager {
    #[builder]
    pub fn new(
        settings: Settings,
        bootloader: Arc<dyn BootloaderDriver>,
        mounter: Arc<dyn Mounter>,
        fs_checker: Arc<dyn FilesystemChecker>,
        disk_probe: Arc<dyn DiskHealthProbe>,
    ) -> Result<Self> {
        settings.validate()?;
        let evaluator = HealthEvaluator::new(
            mounter,
            fs_checker,
            disk_probe,
            settings.critical_files.clone(),
            settings.manifest_path.clone(),
        );

        Ok(Self {
            store: StateStore::new(&settings.state_path),
            repairs: RepairQueue::new(&settings.repair_dir),
            excludes: Excludes::new(&settings.excludes),
            evaluator,
            bootloader,
            settings,
        })
    }
}

impl AbManager {
    /// Wires the OS-backed implementations selected by `settings`.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let shell: Arc<dyn Shell> = Arc::new(Host);
        let bootloader: Arc<dyn BootloaderDriver> = match settings.bootloader {
            BootloaderKind::Efi => {
                let db = efivar::EfiVarDb::from_rootfs(&settings.efivars_root)?;
                Arc::new(EfiBootChain::new(db))
            }
            BootloaderKind::Grub => Arc::new(GrubEnv::new(
                Arc::clone(&shell),
                settings.grubenv.clone(),
                settings.partition_a.boot_entry.clone(),
                settings.partition_b.boot_entry.clone(),
            )),
        };
        let mounter: Arc<dyn Mounter> = match settings.mounter {
            MounterKind::System => Arc::new(SysMounter),
            MounterKind::Passthrough => Arc::new(Passthrough),
        };

        AbManager::builder()
            .fs_checker(Arc::new(Fsck::new(Arc::clone(&shell), settings.fsck_timeout)))
            .disk_probe(Arc::new(Smartctl::new(shell, settings.smart_timeout)))
            .bootloader(bootloader)
            .mounter(mounter)
            .settings(settings)
            .build()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn repairs(&self) -> &RepairQueue {
        &self.repairs
    }

    /// Current state and pending repairs. Doesn't wait for running operations.
    pub fn get_status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            state: self.store.snapshot()?,
            pending_repairs: self.repairs.pending(),
        })
    }

    /// Scores `slot` without recording anything.
    pub fn inspect(&self, slot: Slot) -> Result<HealthReport> {
        let state = self.store.snapshot()?;
        Ok(self.evaluate(slot, &state))
    }

    /// Changes the policy flags; `None` leaves a flag as is.
    pub fn set_policy(
        &self,
        auto_repair: Option<bool>,
        failover: Option<bool>,
    ) -> Result<SystemState> {
        let lock = self.store.lock()?;
        let mut state = self.load(&lock)?;
        if let Some(auto_repair) = auto_repair {
            state.auto_repair_enabled = auto_repair;
        }
        if let Some(failover) = failover {
            state.failover_enabled = failover;
        }
        lock.commit(&state)?;
        info!(
            auto_repair = state.auto_repair_enabled,
            failover = state.failover_enabled,
            "policy updated"
        );
        Ok(state)
    }

    /// Clears the operator attention flag after a human looked at it.
    pub fn acknowledge_attention(&self) -> Result<Option<String>> {
        let lock = self.store.lock()?;
        let mut state = self.load(&lock)?;
        let previous = state.operator_attention.take();
        if previous.is_some() {
            lock.commit(&state)?;
        }
        Ok(previous)
    }

    pub(crate) fn load(&self, lock: &StateLock) -> Result<SystemState> {
        lock.load(|| match self.bootloader.current_boot_target() {
            Ok(slot) => slot,
            Err(e) => {
                warn!("failed to query current boot target, assuming slot A: {e:#}");
                Slot::A
            }
        })
    }

    /// Evaluates `slot`; the boot-loop penalty only applies to the active slot.
    pub(crate) fn evaluate(&self, slot: Slot, state: &SystemState) -> HealthReport {
        let boot_failure_count = if slot == state.active {
            state.boot_failure_count
        } else {
            0
        };
        self.evaluator
            .evaluate(&self.settings.partition(slot), boot_failure_count)
    }
}
