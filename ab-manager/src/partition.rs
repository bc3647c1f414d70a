use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Slot;

/// Static identity of one system partition, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSettings {
    /// Block device holding the root filesystem.
    pub device: PathBuf,
    pub fstype: String,
    /// Whole disk queried for SMART health.
    pub disk: PathBuf,
    /// Bootloader entry name, used by the grub driver.
    pub boot_entry: String,
}

/// A partition together with its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub slot: Slot,
    pub device: PathBuf,
    pub fstype: String,
    pub disk: PathBuf,
    pub boot_entry: String,
}

impl Partition {
    pub fn new(slot: Slot, settings: &PartitionSettings) -> Self {
        Self {
            slot,
            device: settings.device.clone(),
            fstype: settings.fstype.clone(),
            disk: settings.disk.clone(),
            boot_entry: settings.boot_entry.clone(),
        }
    }
}
