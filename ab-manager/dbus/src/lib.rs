//! Query the partition status:
//! ```bash
//! gdbus call --system -d org.worldcoin.AbManager1 -o '/org/worldcoin/AbManager1' -m \
//! org.worldcoin.AbManager1.Status
//! ```
//!
//! Request a repair of slot b:
//! ```bash
//! gdbus call --system -d org.worldcoin.AbManager1 -o '/org/worldcoin/AbManager1' -m \
//! org.worldcoin.AbManager1.RequestRepair b
//! ```

use serde::{Deserialize, Serialize};
use zbus::interface;
use zbus::zvariant::Type;

/// Result of an operation, as shown by the settings GUI.
#[derive(Debug, Serialize, Deserialize, Type, Clone, PartialEq, Eq)]
pub struct Reply {
    pub success: bool,
    pub detail: String,
}

impl Reply {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// Operations the A/B partition manager offers to other processes.
pub trait AbManagerT: Send + Sync + 'static {
    /// JSON encoded system state and pending repairs.
    fn status(&self) -> zbus::fdo::Result<String>;
    fn request_repair(&self, slot: String) -> zbus::fdo::Result<Reply>;
    fn apply_update(&self, image: String, version: String) -> zbus::fdo::Result<Reply>;
    fn activate_update(&self) -> zbus::fdo::Result<Reply>;
    fn rollback(&self) -> zbus::fdo::Result<Reply>;
}

/// A wrapper struct for types implementing [`AbManagerT`].
pub struct AbManager<T: AbManagerT>(pub T);

/// DBus interface implementation for [`AbManager`].
#[interface(
    name = "org.worldcoin.AbManager1",
    proxy(
        default_service = "org.worldcoin.AbManager1",
        default_path = "/org/worldcoin/AbManager1",
    )
)]
impl<T: AbManagerT> AbManagerT for AbManager<T> {
    fn status(&self) -> zbus::fdo::Result<String> {
        self.0.status()
    }

    fn request_repair(&self, slot: String) -> zbus::fdo::Result<Reply> {
        self.0.request_repair(slot)
    }

    fn apply_update(&self, image: String, version: String) -> zbus::fdo::Result<Reply> {
        self.0.apply_update(image, version)
    }

    fn activate_update(&self) -> zbus::fdo::Result<Reply> {
        self.0.activate_update()
    }

    fn rollback(&self) -> zbus::fdo::Result<Reply> {
        self.0.rollback()
    }
}
