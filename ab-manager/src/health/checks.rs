//! Probes backed by OS tools.

use std::{fmt, path::Path, sync::Arc, time::Duration};

use serde::Serialize;
use tracing::debug;

use crate::{Error, Result, partition::Partition, shell::Shell};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsVerdict {
    Clean,
    Damaged(String),
}

/// Non-destructive check of an unmounted filesystem.
pub trait FilesystemChecker: Send + Sync + fmt::Debug {
    fn check(&self, partition: &Partition) -> Result<FsVerdict>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskHealth {
    Healthy,
    Degraded,
    Unreadable,
}

impl DiskHealth {
    pub fn score(self) -> u8 {
        match self {
            DiskHealth::Healthy => 100,
            DiskHealth::Degraded => 50,
            DiskHealth::Unreadable => 0,
        }
    }
}

pub trait DiskHealthProbe: Send + Sync + fmt::Debug {
    fn probe(&self, disk: &Path) -> Result<DiskHealth>;
}

/// `fsck -n`, exit code 0 meaning clean.
#[derive(Debug, Clone)]
pub struct Fsck {
    shell: Arc<dyn Shell>,
    timeout: Duration,
}

impl Fsck {
    pub fn new(shell: Arc<dyn Shell>, timeout: Duration) -> Self {
        Self { shell, timeout }
    }
}

impl FilesystemChecker for Fsck {
    fn check(&self, partition: &Partition) -> Result<FsVerdict> {
        if partition.device.is_dir() {
            debug!(
                "slot {} is an already mounted tree, nothing for fsck to check",
                partition.slot
            );
            return Ok(FsVerdict::Clean);
        }

        let device = partition.device.to_string_lossy();
        let out = self
            .shell
            .exec(
                &["fsck", "-n", "-t", &partition.fstype, &device],
                self.timeout,
            )
            .map_err(|e| Error::health_check("filesystem", e))?;

        match out.code {
            Some(0) => Ok(FsVerdict::Clean),
            Some(code) => Ok(FsVerdict::Damaged(format!(
                "fsck exited with code {code}: {}",
                out.stdout.lines().last().unwrap_or_default()
            ))),
            None => Err(Error::health_check("filesystem", "fsck was killed by a signal")),
        }
    }
}

// smartctl exit status bits, see smartctl(8).
const SMART_CMDLINE_ERROR: i32 = 1 << 0;
const SMART_OPEN_FAILED: i32 = 1 << 1;
const SMART_COMMAND_FAILED: i32 = 1 << 2;
const SMART_DISK_FAILING: i32 = 1 << 3;
const SMART_PREFAIL_OR_ERRORS: i32 = 0xf0;

/// `smartctl -H`.
#[derive(Debug, Clone)]
pub struct Smartctl {
    shell: Arc<dyn Shell>,
    timeout: Duration,
}

impl Smartctl {
    pub fn new(shell: Arc<dyn Shell>, timeout: Duration) -> Self {
        Self { shell, timeout }
    }
}

impl DiskHealthProbe for Smartctl {
    fn probe(&self, disk: &Path) -> Result<DiskHealth> {
        let disk = disk.to_string_lossy();
        let out = self
            .shell
            .exec(&["smartctl", "-H", &disk], self.timeout)
            .map_err(|e| Error::health_check("disk", e))?;
        let code = out
            .code
            .ok_or_else(|| Error::health_check("disk", "smartctl was killed by a signal"))?;

        Ok(classify_smart(code, &out.stdout))
    }
}

fn classify_smart(code: i32, stdout: &str) -> DiskHealth {
    if code & (SMART_CMDLINE_ERROR | SMART_OPEN_FAILED | SMART_COMMAND_FAILED) != 0 {
        return DiskHealth::Unreadable;
    }
    if code & (SMART_DISK_FAILING | SMART_PREFAIL_OR_ERRORS) != 0 {
        return DiskHealth::Degraded;
    }
    let verdict_ok = stdout.lines().any(|line| {
        let line = line.trim();
        (line.contains("overall-health") || line.contains("Health Status"))
            && (line.ends_with("PASSED") || line.ends_with("OK"))
    });
    if verdict_ok {
        DiskHealth::Healthy
    } else {
        DiskHealth::Unreadable
    }
}
