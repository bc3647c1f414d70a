//! The persisted [`SystemState`] and the only code allowed to read or write it.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use rustix::fs::FlockOperation;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{Error, Result, Slot, health::HealthReport};

/// What is remembered about one partition between boots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionRecord {
    pub health: u8,
    pub version: Option<String>,
    /// Digest of the partition's checksum manifest at the last evaluation.
    pub checksum: Option<String>,
    pub last_verified: Option<DateTime<Utc>>,
}

impl Default for PartitionRecord {
    fn default() -> Self {
        Self {
            health: 100,
            version: None,
            checksum: None,
            last_verified: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemState {
    pub active: Slot,
    pub standby: Slot,
    pub partition_a: PartitionRecord,
    pub partition_b: PartitionRecord,
    /// Boots of the active slot not yet confirmed healthy.
    pub boot_failure_count: u32,
    pub update_pending: bool,
    pub rollback_available: bool,
    pub last_successful_boot: Option<DateTime<Utc>>,
    pub auto_repair_enabled: bool,
    pub failover_enabled: bool,
    /// Set when the state had to be recovered from a fallback.
    pub operator_attention: Option<String>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self::first_run(Slot::A)
    }
}

impl SystemState {
    pub fn first_run(active: Slot) -> Self {
        Self {
            active,
            standby: active.opposite(),
            partition_a: PartitionRecord::default(),
            partition_b: PartitionRecord::default(),
            boot_failure_count: 0,
            update_pending: false,
            rollback_available: false,
            last_successful_boot: None,
            auto_repair_enabled: true,
            failover_enabled: true,
            operator_attention: None,
        }
    }

    pub fn partition(&self, slot: Slot) -> &PartitionRecord {
        match slot {
            Slot::A => &self.partition_a,
            Slot::B => &self.partition_b,
        }
    }

    pub fn partition_mut(&mut self, slot: Slot) -> &mut PartitionRecord {
        match slot {
            Slot::A => &mut self.partition_a,
            Slot::B => &mut self.partition_b,
        }
    }

    /// Folds the persisted parts of an evaluation into the partition's record.
    pub fn record_health(&mut self, report: &HealthReport) {
        let record = self.partition_mut(report.slot);
        record.health = report.score;
        record.checksum.clone_from(&report.manifest_digest);
        record.last_verified = Some(report.evaluated_at);
        if record.version.is_none() {
            record.version.clone_from(&report.manifest_version);
        }
    }

    fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.active == self.standby {
            return Err(format!(
                "active and standby are both slot {}",
                self.active
            ));
        }
        Ok(())
    }
}

/// Owner of the state file, its `.last-good` mirror and the advisory lock.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_good_path(&self) -> PathBuf {
        with_suffix(&self.path, ".last-good")
    }

    fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, ".lock")
    }

    /// Blocks until the process-wide advisory lock is held.
    pub fn lock(&self) -> Result<StateLock> {
        let file = self.open_lock_file()?;
        rustix::fs::flock(&file, FlockOperation::LockExclusive).map_err(io::Error::from)?;
        debug!("acquired state lock {:?}", self.lock_path());
        Ok(StateLock {
            store: self.clone(),
            _file: file,
        })
    }

    /// Like [`Self::lock`], but returns `None` instead of waiting for another holder.
    pub fn try_lock(&self) -> Result<Option<StateLock>> {
        let file = self.open_lock_file()?;
        match rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Some(StateLock {
                store: self.clone(),
                _file: file,
            })),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    fn open_lock_file(&self) -> Result<File> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        Ok(file)
    }

    /// Reads the state file without any recovery. `None` if it doesn't exist yet.
    pub fn read_strict(&self) -> Result<Option<SystemState>> {
        read_file(&self.path)
    }

    /// Lock-free read for observers. Recovery happens in memory only; the file is
    /// repaired by the next lock holder.
    pub fn snapshot(&self) -> Result<SystemState> {
        match self.read_strict() {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Ok(SystemState::default()),
            Err(Error::StateCorruption { reason, .. }) => Ok(self.recover(&reason)),
            Err(e) => Err(e),
        }
    }

    fn recover(&self, reason: &str) -> SystemState {
        let last_good = self.last_good_path();
        let mut state = match read_file(&last_good) {
            Ok(Some(state)) => {
                warn!("recovered state from {last_good:?}");
                state
            }
            Ok(None) => {
                warn!("no last-good state available, falling back to defaults");
                SystemState::default()
            }
            Err(e) => {
                warn!("last-good state is unusable too ({e}), falling back to defaults");
                SystemState::default()
            }
        };
        state.operator_attention = Some(format!(
            "state file {:?} was corrupted and replaced by a fallback: {reason}",
            self.path
        ));
        state
    }
}

/// Proof of holding the state lock. Only holders can commit state.
#[derive(Debug)]
pub struct StateLock {
    store: StateStore,
    _file: File,
}

impl StateLock {
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Loads the state, creating it on first run and recovering it when corrupted.
    pub fn load(&self, first_run_active: impl FnOnce() -> Slot) -> Result<SystemState> {
        match self.store.read_strict() {
            Ok(Some(state)) => Ok(state),
            Ok(None) => {
                let state = SystemState::first_run(first_run_active());
                debug!("no state file yet, starting with slot {} active", state.active);
                self.commit(&state)?;
                Ok(state)
            }
            Err(Error::StateCorruption { path, reason }) => {
                error!("state file {path:?} is corrupted: {reason}");
                let state = self.store.recover(&reason);
                self.commit(&state)?;
                Ok(state)
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically replaces the state file and refreshes the `.last-good` mirror.
    pub fn commit(&self, state: &SystemState) -> Result<()> {
        state.check_invariants().map_err(|reason| {
            Error::Other(eyre::eyre!("refusing to persist invalid state: {reason}"))
        })?;
        let contents = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Other(eyre::eyre!("failed to serialize state: {e}")))?;

        write_atomic(self.store.path(), &contents)?;
        if let Err(e) = write_atomic(&self.store.last_good_path(), &contents) {
            warn!("failed to refresh last-good state: {e}");
        }
        debug!("committed state: {state:?}");
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Option<SystemState>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corruption = |reason: String| Error::StateCorruption {
        path: path.to_path_buf(),
        reason,
    };
    let state: SystemState =
        serde_json::from_slice(&contents).map_err(|e| corruption(e.to_string()))?;
    state.check_invariants().map_err(corruption)?;

    Ok(Some(state))
}

/// Temp file in the same directory, fsync, rename, fsync of the directory.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp_file = tempfile::NamedTempFile::new_in(dir)?;
    tmp_file.write_all(contents)?;
    tmp_file.as_file().sync_all()?;
    tmp_file.persist(path).map_err(|e| e.error)?;
    File::open(dir)?.sync_all()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
