use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::providers::Format as _;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::{
    Error, Slot,
    partition::{Partition, PartitionSettings},
};

mod args;
pub use args::Args;

#[cfg(test)]
mod tests;

/// How partitions are made available to the health checks, repair and update.
#[derive(
    Debug, Eq, PartialEq, Serialize, Deserialize, Copy, Clone, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum MounterKind {
    /// mount(2) the block device on a temporary directory.
    System,
    /// The configured device path already is a directory tree.
    Passthrough,
}

/// Which bootloader hook selects the next boot target.
#[derive(
    Debug, Eq, PartialEq, Serialize, Deserialize, Copy, Clone, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BootloaderKind {
    Efi,
    Grub,
}

/// `Settings` are the configurable options of the partition manager.
///
/// The only entry point to construct `Settings` outside of tests is `Settings::get`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    pub state_path: PathBuf,
    pub repair_dir: PathBuf,
    pub partition_a: PartitionSettings,
    pub partition_b: PartitionSettings,
    pub mounter: MounterKind,
    pub bootloader: BootloaderKind,
    /// Root under which `sys/firmware/efi/efivars` is found.
    pub efivars_root: PathBuf,
    pub grubenv: PathBuf,
    /// Location of the checksum manifest, relative to a partition's root.
    pub manifest_path: PathBuf,
    pub critical_files: Vec<PathBuf>,
    /// Top-level trees that repair and update never touch on the target.
    pub excludes: Vec<PathBuf>,
    pub max_boot_attempts: u32,
    pub bootloader_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub bootloader_retry_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub fsck_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub smart_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let partition = |label: &str| PartitionSettings {
            device: PathBuf::from(format!("/dev/disk/by-partlabel/APP_{label}")),
            fstype: "ext4".to_owned(),
            disk: PathBuf::from("/dev/nvme0n1"),
            boot_entry: format!("orb-{label}"),
        };

        Self {
            state_path: PathBuf::from("/usr/persistent/orb-ab-manager/state.json"),
            repair_dir: PathBuf::from("/usr/persistent/orb-ab-manager/repair"),
            partition_a: partition("a"),
            partition_b: partition("b"),
            mounter: MounterKind::System,
            bootloader: BootloaderKind::Efi,
            efivars_root: PathBuf::from("/"),
            grubenv: PathBuf::from("/boot/grub/grubenv"),
            manifest_path: PathBuf::from("etc/orb-ab-manager/manifest.json"),
            critical_files: [
                "boot/extlinux/extlinux.conf",
                "boot/Image",
                "bin/sh",
                "sbin/init",
                "etc/fstab",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
            excludes: [
                "proc",
                "sys",
                "dev",
                "run",
                "tmp",
                "var/tmp",
                "mnt",
                "media",
                "lost+found",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
            max_boot_attempts: 3,
            bootloader_retries: 3,
            bootloader_retry_delay: Duration::from_millis(500),
            fsck_timeout: Duration::from_secs(120),
            smart_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Constructs `Settings` from defaults, a config file, environment variables, and
    /// command line arguments. Command line arguments always take precedence over
    /// environment variables, which in turn take precedence over the config file.
    ///
    /// Nested keys in environment variables are separated by `__`, e.g.
    /// `ORB_AB_MANAGER_PARTITION_A__DEVICE`.
    pub fn get<P: AsRef<Path>>(
        args: &Args,
        config: P,
        env_prefix: &str,
    ) -> figment::error::Result<Settings> {
        figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(Settings::default()))
            .merge(figment::providers::Toml::file(config))
            .merge(figment::providers::Env::prefixed(env_prefix).split("__"))
            .merge(figment::providers::Serialized::defaults(args))
            .extract()
    }

    /// Checks the invariants that deserialization alone can't express.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::InvalidSettings(msg));

        if self.partition_a.device == self.partition_b.device {
            return invalid(format!(
                "both slots resolve to the same device {:?}",
                self.partition_a.device
            ));
        }
        if self.bootloader == BootloaderKind::Grub
            && self.partition_a.boot_entry == self.partition_b.boot_entry
        {
            return invalid(format!(
                "both slots use the same boot entry `{}`",
                self.partition_a.boot_entry
            ));
        }
        if self.max_boot_attempts == 0 {
            return invalid("max_boot_attempts must be at least 1".to_owned());
        }
        if self.bootloader_retries == 0 {
            return invalid("bootloader_retries must be at least 1".to_owned());
        }
        if self.manifest_path.is_absolute() {
            return invalid(format!(
                "manifest_path {:?} must be relative to the partition root",
                self.manifest_path
            ));
        }
        if self.fsck_timeout.is_zero() || self.smart_timeout.is_zero() {
            return invalid("command timeouts must be non-zero".to_owned());
        }

        Ok(())
    }

    pub fn partition(&self, slot: Slot) -> Partition {
        match slot {
            Slot::A => Partition::new(slot, &self.partition_a),
            Slot::B => Partition::new(slot, &self.partition_b),
        }
    }
}
