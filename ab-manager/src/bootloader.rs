//! Hooks that select which slot the firmware/bootloader starts next.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use eyre::{Result, WrapErr, bail, ensure};
use tracing::{debug, info};

use crate::{Slot, efivar::EfiVarDb, shell::Shell};

pub trait BootloaderDriver: Send + Sync + fmt::Debug {
    /// Makes `slot` the target of the next and all following boots.
    fn set_boot_target(&self, slot: Slot) -> Result<()>;

    /// The slot the bootloader currently considers its target.
    fn current_boot_target(&self) -> Result<Slot>;

    /// Tells the bootloader that `slot` booted fine, e.g. resetting retry counters.
    fn mark_boot_successful(&self, slot: Slot) -> Result<()>;
}

const PATH_CURRENT: &str = "BootChainFwCurrent-781e084c-a330-417c-b678-38e696380cb9";
const PATH_NEXT: &str = "BootChainFwNext-781e084c-a330-417c-b678-38e696380cb9";
const PATH_RETRY_COUNT_A: &str =
    "RootfsRetryCountA-781e084c-a330-417c-b678-38e696380cb9";
const PATH_RETRY_COUNT_B: &str =
    "RootfsRetryCountB-781e084c-a330-417c-b678-38e696380cb9";
const PATH_RETRY_COUNT_MAX: &str =
    "RootfsRetryCountMax-781e084c-a330-417c-b678-38e696380cb9";

const EXPECTED_LEN: usize = 8;
const NEW_BUFFER: [u8; EXPECTED_LEN] = [0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
// All values of interest live in byte 4.
const VALUE_OFFSET: usize = 4;

const EFI_SLOT_A: u8 = 0;
const EFI_SLOT_B: u8 = 1;

/// Drives NVIDIA's BootChain efivars.
#[derive(Debug, Clone)]
pub struct EfiBootChain {
    db: EfiVarDb,
}

impl EfiBootChain {
    pub fn new(db: EfiVarDb) -> Self {
        Self { db }
    }

    fn read_value(&self, name: &str) -> Result<u8> {
        let buffer = self.db.get_var(name)?.read()?;
        ensure!(
            buffer.len() == EXPECTED_LEN,
            "invalid efivar data length for {name}. expected: {EXPECTED_LEN}, actual: {}",
            buffer.len()
        );
        Ok(buffer[VALUE_OFFSET])
    }

    fn write_value(&self, name: &str, value: u8) -> Result<()> {
        let var = self.db.get_var(name)?;
        let mut buffer = match var.read() {
            Ok(buffer) if buffer.len() == EXPECTED_LEN => buffer,
            _ => NEW_BUFFER.to_vec(),
        };
        buffer[VALUE_OFFSET] = value;
        var.write(&buffer)
    }
}

fn slot_to_efi(slot: Slot) -> u8 {
    match slot {
        Slot::A => EFI_SLOT_A,
        Slot::B => EFI_SLOT_B,
    }
}

impl BootloaderDriver for EfiBootChain {
    fn set_boot_target(&self, slot: Slot) -> Result<()> {
        self.write_value(PATH_NEXT, slot_to_efi(slot))
            .wrap_err_with(|| format!("failed to set next boot slot to {slot}"))?;
        info!("efi: next boot slot set to {slot}");
        Ok(())
    }

    fn current_boot_target(&self) -> Result<Slot> {
        match self.read_value(PATH_CURRENT)? {
            EFI_SLOT_A => Ok(Slot::A),
            EFI_SLOT_B => Ok(Slot::B),
            other => bail!("invalid slot configuration: {other}"),
        }
    }

    fn mark_boot_successful(&self, slot: Slot) -> Result<()> {
        let max = match self.read_value(PATH_RETRY_COUNT_MAX) {
            Ok(max) => max,
            Err(e) => {
                debug!("no retry counter maximum available, skipping reset: {e:#}");
                return Ok(());
            }
        };
        let counter = match slot {
            Slot::A => PATH_RETRY_COUNT_A,
            Slot::B => PATH_RETRY_COUNT_B,
        };
        self.write_value(counter, max)
            .wrap_err_with(|| format!("failed to reset retry counter of slot {slot}"))
    }
}

const GRUB_EDITENV_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives a grub environment block through `grub-editenv`.
#[derive(Debug, Clone)]
pub struct GrubEnv {
    shell: Arc<dyn Shell>,
    grubenv: PathBuf,
    entry_a: String,
    entry_b: String,
}

impl GrubEnv {
    pub fn new(
        shell: Arc<dyn Shell>,
        grubenv: PathBuf,
        entry_a: String,
        entry_b: String,
    ) -> Self {
        Self {
            shell,
            grubenv,
            entry_a,
            entry_b,
        }
    }

    fn entry(&self, slot: Slot) -> &str {
        match slot {
            Slot::A => &self.entry_a,
            Slot::B => &self.entry_b,
        }
    }

    fn editenv(&self, args: &[&str]) -> Result<String> {
        let grubenv = self.grubenv.to_string_lossy();
        let mut cmd = vec!["grub-editenv", &*grubenv];
        cmd.extend_from_slice(args);
        let out = self.shell.exec(&cmd, GRUB_EDITENV_TIMEOUT)?;
        ensure!(
            out.success(),
            "`{}` exited with {:?}: {}",
            cmd.join(" "),
            out.code,
            out.stderr.trim()
        );
        Ok(out.stdout)
    }
}

impl BootloaderDriver for GrubEnv {
    fn set_boot_target(&self, slot: Slot) -> Result<()> {
        let entry = self.entry(slot);
        self.editenv(&[
            "set",
            &format!("saved_entry={entry}"),
            &format!("next_entry={entry}"),
        ])?;
        info!("grub: boot entry set to {entry} (slot {slot})");
        Ok(())
    }

    fn current_boot_target(&self) -> Result<Slot> {
        let listing = self.editenv(&["list"])?;
        let saved = listing
            .lines()
            .find_map(|line| line.strip_prefix("saved_entry="))
            .map(str::trim);
        match saved {
            Some(entry) if entry == self.entry_a => Ok(Slot::A),
            Some(entry) if entry == self.entry_b => Ok(Slot::B),
            Some(entry) => bail!("saved_entry `{entry}` matches neither slot"),
            None => bail!("no saved_entry in {:?}", self.grubenv),
        }
    }

    fn mark_boot_successful(&self, _slot: Slot) -> Result<()> {
        self.editenv(&["set", "boot_success=1"]).map(drop)
    }
}
