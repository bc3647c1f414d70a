use std::{io::Write, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{Result, eyre::WrapErr as _};
use tracing::{error, info, warn};

use crate::{
    AbManager, Args, BootOutcome, Slot,
    shell::{Host, Shell},
};

/// Supervises the A/B system partitions of the Orb.
///
/// Runs a health check at every boot and fails over to the standby partition when
/// the active one is unhealthy, repairs a damaged partition from its healthy twin,
/// and stages updates on the standby partition.
#[derive(Debug, Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(flatten)]
    pub args: Args,
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Score the active slot for this boot. Exits with 2 after failing over.
    BootCheck {
        /// Reboot into the new active slot after failing over.
        #[arg(long)]
        reboot: bool,
    },
    /// Print the persisted state and pending repairs as JSON.
    Status,
    /// Score a slot without recording the result.
    Inspect { slot: Slot },
    /// Resynchronize a slot from the other one.
    Repair { slot: Slot },
    /// Run every scheduled repair.
    RepairPending,
    /// Install an update image onto the standby slot.
    ApplyUpdate {
        image: PathBuf,
        /// Version installed by the image.
        #[arg(long)]
        version: String,
    },
    /// Boot the staged update next.
    ActivateUpdate,
    /// Boot the previously active slot next.
    Rollback,
    /// Make the standby slot active.
    Failover,
    /// Show or change the repair and failover policy.
    Policy {
        #[arg(long, value_enum)]
        auto_repair: Option<Toggle>,
        #[arg(long, value_enum)]
        failover: Option<Toggle>,
    },
    /// Clear the operator attention flag.
    Ack,
    /// Serve the dbus interface.
    Serve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl From<Toggle> for bool {
    fn from(toggle: Toggle) -> Self {
        toggle == Toggle::On
    }
}

/// How the process should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    /// A failover happened; the caller must reboot.
    FailedOver,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        match exit {
            Exit::Success => ExitCode::SUCCESS,
            Exit::FailedOver => ExitCode::from(2),
        }
    }
}

const REBOOT_TIMEOUT: Duration = Duration::from_secs(30);

fn print_json(out: &mut impl Write, value: &impl serde::Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

pub fn run(manager: Arc<AbManager>, cmd: Commands, out: &mut impl Write) -> Result<Exit> {
    match cmd {
        Commands::BootCheck { reboot } => {
            let outcome = manager.boot_check()?;
            print_json(out, &outcome)?;
            if outcome.proceed() {
                return Ok(Exit::Success);
            }
            if let BootOutcome::Failover { to, .. } = &outcome {
                info!("slot {to} will boot next");
            }
            if reboot {
                request_reboot(&Host);
            }
            return Ok(Exit::FailedOver);
        }
        Commands::Status => print_json(out, &manager.get_status()?)?,
        Commands::Inspect { slot } => print_json(out, &manager.inspect(slot)?)?,
        Commands::Repair { slot } => print_json(out, &manager.request_repair(slot)?)?,
        Commands::RepairPending => {
            let mut failures = 0;
            for (slot, result) in manager.run_pending_repairs()? {
                match result {
                    Ok(outcome) => print_json(out, &outcome)?,
                    Err(e) => {
                        failures += 1;
                        writeln!(out, "repair of slot {slot} failed: {e}")?;
                    }
                }
            }
            if failures > 0 {
                color_eyre::eyre::bail!("{failures} repair(s) failed");
            }
        }
        Commands::ApplyUpdate { image, version } => {
            print_json(out, &manager.apply_update(&image, &version)?)?;
        }
        Commands::ActivateUpdate => print_json(out, &manager.activate_update()?)?,
        Commands::Rollback => print_json(out, &manager.rollback()?)?,
        Commands::Failover => print_json(out, &manager.failover()?)?,
        Commands::Policy {
            auto_repair,
            failover,
        } => {
            let state = manager
                .set_policy(auto_repair.map(bool::from), failover.map(bool::from))?;
            writeln!(
                out,
                "auto repair: {}, failover: {}",
                toggle_str(state.auto_repair_enabled),
                toggle_str(state.failover_enabled)
            )?;
        }
        Commands::Ack => match manager.acknowledge_attention()? {
            Some(reason) => writeln!(out, "acknowledged: {reason}")?,
            None => writeln!(out, "nothing to acknowledge")?,
        },
        Commands::Serve => {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .wrap_err("failed to build tokio runtime")?
                .block_on(crate::dbus::serve(manager))?;
        }
    }

    Ok(Exit::Success)
}

fn toggle_str(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn request_reboot(shell: &dyn Shell) {
    warn!("rebooting into the new active slot");
    match shell.exec(&["systemctl", "reboot"], REBOOT_TIMEOUT) {
        Ok(out) if out.success() => {}
        Ok(out) => error!("`systemctl reboot` exited with {:?}: {}", out.code, out.stderr),
        Err(e) => error!("failed to request reboot: {e}"),
    }
}
