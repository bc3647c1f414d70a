//! Log setup for the binary.

use std::io::IsTerminal as _;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

pub const SYSLOG_IDENTIFIER: &str = "worldcoin-ab-manager";

/// Logs to journald when running under systemd, otherwise to stderr. The level
/// defaults to INFO and is overridden by `RUST_LOG`.
pub fn try_init(
    syslog_identifier: &str,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // Checking for a terminal helps detect if we are running under systemd.
    let journald_layer = if std::io::stderr().is_terminal() {
        None
    } else {
        tracing_journald::layer()
            .inspect_err(|err| {
                eprintln!(
                    "failed connecting to journald socket. will write to stderr: {err}"
                );
            })
            .map(|layer| layer.with_syslog_identifier(syslog_identifier.to_owned()))
            .ok()
    };
    let stderr_layer = journald_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(journald_layer)
        .with(filter)
        .try_init()
}
