//! Staging an update image on the standby slot, activating it, and rolling back.

use std::{
    fs::{self, File},
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use eyre::{WrapErr as _, eyre};
use tracing::{debug, error, info, instrument};

use crate::{
    AbManager, Error, Result, Slot, SystemState,
    failover::SwapKind,
    health::{HealthReport, VERIFIED_SCORE},
    mount::MountMode,
    tree::{self, Excludes},
    util,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Zstd,
    Xz,
}

impl Compression {
    fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".gz") || name.ends_with(".tgz") {
            Compression::Gzip
        } else if name.ends_with(".zst") || name.ends_with(".zstd") {
            Compression::Zstd
        } else if name.ends_with(".xz") || name.ends_with(".txz") {
            Compression::Xz
        } else {
            Compression::None
        }
    }
}

/// `<image>.sha256`, as written by `sha256sum`.
fn checksum_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Compares the image against its detached checksum file.
pub fn verify_image(image: &Path) -> Result<()> {
    let sums = checksum_path(image);
    let contents = fs::read_to_string(&sums)
        .wrap_err_with(|| format!("failed to read checksum file {sums:?}"))?;
    let expected = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| eyre!("checksum file {sums:?} is empty"))?
        .to_lowercase();
    let actual = util::sha256_file(image)?;
    if actual != expected {
        return Err(Error::ImageChecksumMismatch {
            path: image.to_path_buf(),
            expected,
            actual,
        });
    }
    debug!("image {image:?} matches {expected}");
    Ok(())
}

/// Unpacks a (possibly compressed) tar archive into `root`, skipping excluded trees.
pub fn unpack(image: &Path, root: &Path, excludes: &Excludes) -> eyre::Result<u64> {
    let file = BufReader::new(
        File::open(image).wrap_err_with(|| format!("failed to open image {image:?}"))?,
    );
    let reader: Box<dyn Read> = match Compression::from_path(image) {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(file)
                .wrap_err("failed to create zstd decoder")?,
        ),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_overwrite(true);

    let mut unpacked = 0;
    for entry in archive.entries().wrap_err("failed to read image entries")? {
        let mut entry = entry.wrap_err("corrupt image entry")?;
        let path = entry.path()?.into_owned();
        if excludes.covers(&path) {
            debug!("skipping excluded entry {path:?}");
            continue;
        }
        entry
            .unpack_in(root)
            .wrap_err_with(|| format!("failed to unpack {path:?}"))?;
        unpacked += 1;
    }

    Ok(unpacked)
}

impl AbManager {
    /// Installs `image` onto the standby slot and marks it pending activation.
    ///
    /// Never changes which slot is active.
    #[instrument(skip(self))]
    pub fn apply_update(&self, image: &Path, version: &str) -> Result<HealthReport> {
        verify_image(image)?;

        let lock = self.store.lock()?;
        let state = self.load(&lock)?;
        let standby = state.standby;
        let guard = self
            .evaluator
            .mounter()
            .mount(&self.settings.partition(standby), MountMode::ReadWrite)?;

        // From here on the standby no longer holds what it used to: no staged
        // update survives and there is nothing left to roll back to.
        let mut next = state.clone();
        next.update_pending = false;
        next.rollback_available = false;
        next.partition_mut(standby).version = None;

        let installed = self.install(image, standby, guard.root());
        drop(guard);
        if let Err(e) = installed {
            let report = self.evaluate(standby, &state);
            next.record_health(&report);
            lock.commit(&next)?;
            error!("failed to install {image:?} on slot {standby}: {e}; now {report}");
            return Err(e);
        }

        let report = self.evaluate(standby, &state);
        next.record_health(&report);
        if report.score <= VERIFIED_SCORE {
            lock.commit(&next)?;
            error!("update on slot {standby} did not verify: {report}");
            return Err(Error::UpdateVerificationFailed {
                slot: standby,
                score: report.score,
            });
        }

        next.update_pending = true;
        next.partition_mut(standby).version = Some(version.to_owned());
        lock.commit(&next)?;
        self.repairs.remove(standby)?;
        info!("update {version} staged on slot {standby}");

        Ok(report)
    }

    fn install(&self, image: &Path, standby: Slot, root: &Path) -> Result<()> {
        let removed = tree::clear(root, &self.excludes)?;
        debug!("cleared {removed} entries from slot {standby}");
        let unpacked = unpack(image, root, &self.excludes)?;
        info!("unpacked {unpacked} entries of {image:?} onto slot {standby}");
        Ok(())
    }

    /// Switches to the staged update. Requires a prior successful `apply_update`.
    #[instrument(skip(self))]
    pub fn activate_update(&self) -> Result<SystemState> {
        let lock = self.store.lock()?;
        let state = self.load(&lock)?;
        if !state.update_pending {
            return Err(Error::NoPendingUpdate);
        }
        self.swap(&lock, &state, SwapKind::Activation)
    }

    /// Switches back to the previously active slot, once.
    #[instrument(skip(self))]
    pub fn rollback(&self) -> Result<SystemState> {
        let lock = self.store.lock()?;
        let state = self.load(&lock)?;
        if !state.rollback_available {
            return Err(Error::RollbackUnavailable);
        }
        self.swap(&lock, &state, SwapKind::Rollback)
    }
}
