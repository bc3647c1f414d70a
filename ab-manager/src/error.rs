use std::path::PathBuf;

use crate::Slot;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by every public operation of the partition manager.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A health sub-check could not run. Scored as worst case by the evaluator.
    #[error("health check `{check}` could not run: {reason}")]
    HealthCheckFailed { check: &'static str, reason: String },
    /// The only alternative partition is not healthy enough to take over.
    #[error(
        "slot {slot} scored {score}, below the required {required}; manual intervention required"
    )]
    InsufficientStandbyHealth { slot: Slot, score: u8, required: u8 },
    #[error("state file {path:?} is corrupted: {reason}")]
    StateCorruption { path: PathBuf, reason: String },
    /// The bootloader could not be pointed at `slot`; nothing was committed.
    #[error("failed to set boot target to slot {slot} after {attempts} attempts: {reason}")]
    BootloaderUpdateFailed {
        slot: Slot,
        attempts: u32,
        reason: String,
    },
    #[error("refusing to repair slot {0}: it is the active slot")]
    RepairTargetActive(Slot),
    #[error("slot {slot} scored {score} after repair")]
    RepairVerificationFailed { slot: Slot, score: u8 },
    #[error("slot {slot} scored {score} after installing the update")]
    UpdateVerificationFailed { slot: Slot, score: u8 },
    #[error("checksum mismatch for update image {path:?}: expected {expected}, got {actual}")]
    ImageChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("no update is pending activation")]
    NoPendingUpdate,
    #[error("no previous slot is available to roll back to")]
    RollbackUnavailable,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl Error {
    pub(crate) fn health_check(check: &'static str, reason: impl ToString) -> Self {
        Self::HealthCheckFailed {
            check,
            reason: reason.to_string(),
        }
    }
}
