use serde::Serialize;

use crate::settings::{BootloaderKind, MounterKind};

/// Options shared by every subcommand. Each one overrides the matching key of the
/// config file and the environment.
#[derive(Debug, Default, clap::Args, Serialize)]
pub struct Args {
    /// The path to the config file.
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// The path to the persisted system state.
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<String>,
    /// The directory holding pending repair markers.
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_dir: Option<String>,
    #[arg(long, global = true, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounter: Option<MounterKind>,
    #[arg(long, global = true, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<BootloaderKind>,
    /// Root directory under which the efivars filesystem is found.
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efivars_root: Option<String>,
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grubenv: Option<String>,
    /// Consecutive unconfirmed boots tolerated before failing over.
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_boot_attempts: Option<u32>,
    /// Timeout in milliseconds for the non-destructive filesystem check.
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fsck_timeout: Option<u64>,
}
