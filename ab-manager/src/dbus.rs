//! Exposes [`AbManager`] on the system bus for the settings GUI.

use std::{fmt::Display, sync::Arc};

use eyre::WrapErr as _;
use orb_ab_manager_dbus::{AbManagerT, Reply};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, warn};
use zbus::fdo;

use crate::{AbManager, Result, Slot};

pub const SERVICE_NAME: &str = "org.worldcoin.AbManager1";
pub const OBJECT_PATH: &str = "/org/worldcoin/AbManager1";

#[derive(Debug, Clone)]
pub struct Service(pub Arc<AbManager>);

/// Repairs and updates take minutes; keep the executor responsive meanwhile.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn to_reply<T>(result: Result<T>, describe: impl FnOnce(T) -> String) -> Reply {
    match result {
        Ok(value) => Reply::ok(describe(value)),
        Err(e) => {
            warn!("dbus request failed: {e}");
            Reply::failed(e.to_string())
        }
    }
}

fn failed(e: impl Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

impl AbManagerT for Service {
    fn status(&self) -> fdo::Result<String> {
        let status = blocking(|| self.0.get_status()).map_err(failed)?;
        serde_json::to_string(&status).map_err(failed)
    }

    fn request_repair(&self, slot: String) -> fdo::Result<Reply> {
        let slot: Slot = slot
            .parse()
            .map_err(|e| fdo::Error::InvalidArgs(format!("{e}")))?;
        let result = blocking(|| self.0.request_repair(slot));
        Ok(to_reply(result, |outcome| {
            format!(
                "slot {} repaired from slot {}, health {}",
                outcome.target, outcome.source, outcome.score
            )
        }))
    }

    fn apply_update(&self, image: String, version: String) -> fdo::Result<Reply> {
        let result = blocking(|| self.0.apply_update(image.as_ref(), &version));
        Ok(to_reply(result, |report| {
            format!(
                "update {version} staged on slot {}, health {}",
                report.slot, report.score
            )
        }))
    }

    fn activate_update(&self) -> fdo::Result<Reply> {
        let result = blocking(|| self.0.activate_update());
        Ok(to_reply(result, |state| {
            format!("slot {} will boot next", state.active)
        }))
    }

    fn rollback(&self) -> fdo::Result<Reply> {
        let result = blocking(|| self.0.rollback());
        Ok(to_reply(result, |state| {
            format!("rolled back, slot {} will boot next", state.active)
        }))
    }
}

/// Serves the interface until interrupted.
pub async fn serve(manager: Arc<AbManager>) -> eyre::Result<()> {
    let _conn = zbus::connection::Builder::system()
        .wrap_err("failed creating a new system dbus connection")?
        .name(SERVICE_NAME)
        .wrap_err_with(|| format!("failed to register dbus connection name: `{SERVICE_NAME}`"))?
        .serve_at(OBJECT_PATH, orb_ab_manager_dbus::AbManager(Service(manager)))
        .wrap_err_with(|| format!("failed to serve dbus interface at `{OBJECT_PATH}`"))?
        .build()
        .await
        .wrap_err("failed to establish dbus connection")?;
    info!("serving {SERVICE_NAME} at {OBJECT_PATH}");

    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
