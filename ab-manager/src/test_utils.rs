//! A fixture running [`AbManager`] against two directory-backed partitions with
//! scripted filesystem, disk and bootloader behaviour.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use bon::bon;
use clap::Parser as _;
use eyre::bail;
use tempfile::TempDir;

use crate::{
    AbManager, Error, Result, Settings, Slot, SystemState,
    bootloader::BootloaderDriver,
    health::{DiskHealth, DiskHealthProbe, FilesystemChecker, FsVerdict, manifest::Manifest},
    mount::Passthrough,
    partition::Partition,
    program::{self, Cli, Exit},
    settings::MounterKind,
    util,
};

/// Filesystem verdicts per slot. Clean unless told otherwise.
#[derive(Debug, Default)]
pub struct ScriptedFs {
    verdicts: Mutex<HashMap<Slot, FsVerdict>>,
    failures: Mutex<HashMap<Slot, u32>>,
}

impl ScriptedFs {
    pub fn set(&self, slot: Slot, verdict: FsVerdict) {
        self.verdicts.lock().unwrap().insert(slot, verdict);
    }

    /// The next `times` checks of `slot` fail to run.
    pub fn fail(&self, slot: Slot, times: u32) {
        self.failures.lock().unwrap().insert(slot, times);
    }
}

impl FilesystemChecker for ScriptedFs {
    fn check(&self, partition: &Partition) -> Result<FsVerdict> {
        if let Some(left) = self.failures.lock().unwrap().get_mut(&partition.slot)
            && *left > 0
        {
            *left -= 1;
            return Err(Error::health_check("fsck", "scripted failure"));
        }
        Ok(self
            .verdicts
            .lock()
            .unwrap()
            .get(&partition.slot)
            .cloned()
            .unwrap_or(FsVerdict::Clean))
    }
}

/// Disk health per disk path. Healthy unless told otherwise.
#[derive(Debug, Default)]
pub struct ScriptedDisk {
    health: Mutex<HashMap<PathBuf, DiskHealth>>,
}

impl ScriptedDisk {
    pub fn set(&self, disk: impl Into<PathBuf>, health: DiskHealth) {
        self.health.lock().unwrap().insert(disk.into(), health);
    }
}

impl DiskHealthProbe for ScriptedDisk {
    fn probe(&self, disk: &Path) -> Result<DiskHealth> {
        Ok(self
            .health
            .lock()
            .unwrap()
            .get(disk)
            .copied()
            .unwrap_or(DiskHealth::Healthy))
    }
}

#[derive(Debug)]
struct BootloaderInner {
    target: Slot,
    set_calls: Vec<Slot>,
    confirmed: Vec<Slot>,
    failures: u32,
}

/// Remembers every request instead of touching firmware.
#[derive(Debug)]
pub struct RecordingBootloader(Mutex<BootloaderInner>);

impl RecordingBootloader {
    pub fn new(target: Slot) -> Self {
        Self(Mutex::new(BootloaderInner {
            target,
            set_calls: Vec::new(),
            confirmed: Vec::new(),
            failures: 0,
        }))
    }

    pub fn target(&self) -> Slot {
        self.0.lock().unwrap().target
    }

    /// Every slot `set_boot_target` was called with, including failed calls.
    pub fn set_calls(&self) -> Vec<Slot> {
        self.0.lock().unwrap().set_calls.clone()
    }

    pub fn confirmed(&self) -> Vec<Slot> {
        self.0.lock().unwrap().confirmed.clone()
    }

    /// The next `times` calls to `set_boot_target` fail.
    pub fn fail(&self, times: u32) {
        self.0.lock().unwrap().failures = times;
    }
}

impl BootloaderDriver for RecordingBootloader {
    fn set_boot_target(&self, slot: Slot) -> eyre::Result<()> {
        let mut inner = self.0.lock().unwrap();
        inner.set_calls.push(slot);
        if inner.failures > 0 {
            inner.failures -= 1;
            bail!("scripted bootloader failure");
        }
        inner.target = slot;
        Ok(())
    }

    fn current_boot_target(&self) -> eyre::Result<Slot> {
        Ok(self.0.lock().unwrap().target)
    }

    fn mark_boot_successful(&self, slot: Slot) -> eyre::Result<()> {
        self.0.lock().unwrap().confirmed.push(slot);
        Ok(())
    }
}

/// Writes a complete, verifiable partition tree of `version` into `root`.
pub fn populate(root: &Path, settings: &Settings, version: &str) {
    let mut files = BTreeMap::new();
    for rel in &settings.critical_files {
        let content = format!("{} {version}\n", rel.display());
        write_file(&root.join(rel), content.as_bytes());
        files.insert(rel.clone(), util::sha256_bytes(content.as_bytes()));
    }
    let lib = format!("libfoo {version}\n");
    write_file(&root.join("usr/lib/libfoo.so"), lib.as_bytes());
    files.insert("usr/lib/libfoo.so".into(), util::sha256_bytes(lib.as_bytes()));
    for dir in &settings.excludes {
        fs::create_dir_all(root.join(dir)).unwrap();
    }

    let manifest = Manifest {
        version: version.to_owned(),
        files,
    };
    write_file(
        &root.join(&settings.manifest_path),
        &serde_json::to_vec_pretty(&manifest).unwrap(),
    );
}

fn write_file(path: &Path, contents: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

pub struct Fixture {
    _tempdir: TempDir,
    pub root: PathBuf,
    pub settings: Settings,
    pub manager: Arc<AbManager>,
    pub fs: Arc<ScriptedFs>,
    pub disk: Arc<ScriptedDisk>,
    pub bootloader: Arc<RecordingBootloader>,
}

#[bon]
impl Fixture {
    /// Both partitions hold version `1.0` and score 100. Without `state`, the
    /// state file is created on first use with `boot_target` as the active slot.
    #[builder]
    pub fn new(
        #[builder(default = Slot::A)] boot_target: Slot,
        state: Option<SystemState>,
        #[builder(default = 3)] max_boot_attempts: u32,
        #[builder(default = 3)] bootloader_retries: u32,
        #[builder(default = "1.0")] version: &str,
    ) -> Fixture {
        let tempdir = TempDir::new().unwrap();
        let root = tempdir.path().to_path_buf();

        let mut settings = Settings {
            state_path: root.join("persistent/state.json"),
            repair_dir: root.join("persistent/repair"),
            mounter: MounterKind::Passthrough,
            max_boot_attempts,
            bootloader_retries,
            bootloader_retry_delay: Duration::from_millis(1),
            ..Settings::default()
        };
        for slot in Slot::ALL {
            let partition = match slot {
                Slot::A => &mut settings.partition_a,
                Slot::B => &mut settings.partition_b,
            };
            partition.device = root.join(format!("slot-{slot}"));
            partition.disk = root.join(format!("disk-{slot}"));
        }
        for slot in Slot::ALL {
            populate(&settings.partition(slot).device, &settings, version);
        }

        if let Some(state) = &state {
            write_file(&settings.state_path, &serde_json::to_vec_pretty(state).unwrap());
        }

        let fs = Arc::new(ScriptedFs::default());
        let disk = Arc::new(ScriptedDisk::default());
        let bootloader = Arc::new(RecordingBootloader::new(boot_target));
        let manager = AbManager::builder()
            .settings(settings.clone())
            .bootloader(bootloader.clone())
            .mounter(Arc::new(Passthrough))
            .fs_checker(fs.clone())
            .disk_probe(disk.clone())
            .build()
            .unwrap();

        Self {
            _tempdir: tempdir,
            root,
            settings,
            manager: Arc::new(manager),
            fs,
            disk,
            bootloader,
        }
    }
}

impl Fixture {
    pub fn partition_root(&self, slot: Slot) -> PathBuf {
        self.settings.partition(slot).device
    }

    /// The persisted state. Panics if there is none yet.
    pub fn state(&self) -> SystemState {
        self.manager.store().read_strict().unwrap().unwrap()
    }

    pub fn state_bytes(&self) -> Vec<u8> {
        fs::read(&self.settings.state_path).unwrap()
    }

    pub fn set_disk(&self, slot: Slot, health: DiskHealth) {
        self.disk.set(self.settings.partition(slot).disk, health);
    }

    /// Deletes a file of `slot`; `rel` is relative to the partition root.
    pub fn remove(&self, slot: Slot, rel: &str) {
        fs::remove_file(self.partition_root(slot).join(rel)).unwrap();
    }

    /// Overwrites a file of `slot` without updating the manifest.
    pub fn tamper(&self, slot: Slot, rel: &str) {
        write_file(&self.partition_root(slot).join(rel), b"tampered\n");
    }

    /// Breaks `slot` beyond use: damaged filesystem and every critical file gone.
    /// Scores 20.
    pub fn corrupt(&self, slot: Slot) {
        self.fs.set(slot, FsVerdict::Damaged("scripted corruption".into()));
        for rel in &self.settings.critical_files {
            let _ = fs::remove_file(self.partition_root(slot).join(rel));
        }
    }

    /// Builds a gzipped update image of `version` with its `.sha256` file.
    pub fn image(&self, version: &str) -> PathBuf {
        let staging = self.root.join(format!("staging-{version}"));
        populate(&staging, &self.settings, version);

        let image = self.root.join(format!("update-{version}.tar.gz"));
        let encoder = flate2::write::GzEncoder::new(
            fs::File::create(&image).unwrap(),
            flate2::Compression::fast(),
        );
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &staging).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let digest = util::sha256_file(&image).unwrap();
        let name = image.file_name().unwrap().to_string_lossy().into_owned();
        let mut sums = image.clone().into_os_string();
        sums.push(".sha256");
        fs::write(sums, format!("{digest}  {name}\n")).unwrap();
        image
    }

    /// Like [`Fixture::image`], cut in half with a checksum file that matches the
    /// truncated archive.
    pub fn truncated_image(&self, version: &str) -> PathBuf {
        let image = self.image(version);
        let bytes = fs::read(&image).unwrap();
        fs::write(&image, &bytes[..bytes.len() / 2]).unwrap();

        let digest = util::sha256_file(&image).unwrap();
        let mut sums = image.clone().into_os_string();
        sums.push(".sha256");
        fs::write(sums, format!("{digest}  truncated.tar.gz\n")).unwrap();
        image
    }

    /// Runs a command line, e.g. `"policy --failover off"`, returning its output.
    pub fn run(&self, cmd: &str) -> color_eyre::Result<(Exit, String)> {
        let mut argv = vec!["orb-ab-manager"];
        argv.extend(cmd.split_whitespace());
        let cli = Cli::try_parse_from(&argv)?;

        let mut out = Vec::new();
        let exit = program::run(Arc::clone(&self.manager), cli.cmd, &mut out)?;
        Ok((exit, String::from_utf8(out)?))
    }
}
