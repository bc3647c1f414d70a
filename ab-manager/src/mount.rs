use std::{
    ffi::CString,
    fmt, io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use tracing::{debug, error, warn};

use crate::partition::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// Makes a partition's tree available for the lifetime of a [`MountGuard`].
pub trait Mounter: Send + Sync + fmt::Debug {
    fn mount(&self, partition: &Partition, mode: MountMode) -> io::Result<MountGuard>;
}

/// Access to a partition's root. Unmounts on drop when it owns the mount.
pub struct MountGuard {
    root: PathBuf,
    mount_point: Option<tempfile::TempDir>,
}

impl MountGuard {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A guard over a tree that is already available and must not be unmounted.
    pub fn borrowed(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mount_point: None,
        }
    }
}

impl fmt::Debug for MountGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountGuard")
            .field("root", &self.root)
            .field("owned", &self.mount_point.is_some())
            .finish()
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        let Some(mount_point) = self.mount_point.take() else {
            return;
        };
        if let Err(e) = sys_umount(mount_point.path(), false) {
            warn!(
                "failed to unmount {}: {e}; detaching lazily",
                mount_point.path().display()
            );
            if let Err(e) = sys_umount(mount_point.path(), true) {
                error!("failed to detach {}: {e}", mount_point.path().display());
                // The tree is still mounted: removing the directory would recurse
                // into the partition, so leave it in place.
                std::mem::forget(mount_point);
                return;
            }
        }
        debug!("unmounted {}", mount_point.path().display());
    }
}

/// Mounts block devices with mount(2) on a fresh temporary directory.
///
/// A device that is already mounted (the running root, for one) is reused in
/// place: a second mount with different read-only flags is refused by the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn mount(&self, partition: &Partition, mode: MountMode) -> io::Result<MountGuard> {
        let device = partition.device.canonicalize()?;

        let rdev = rustix::fs::stat(&device)?.st_rdev;
        let id = DeviceId {
            major: rustix::fs::major(rdev),
            minor: rustix::fs::minor(rdev),
        };
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        if let Some(existing) = find_mount(&mountinfo, id) {
            return reuse(partition, existing, mode);
        }

        let mount_point = tempfile::Builder::new()
            .prefix(&format!("orb-ab-{}-", partition.slot))
            .tempdir()?;
        sys_mount(&device, mount_point.path(), &partition.fstype, mode)?;
        debug!(
            "mounted {} ({mode:?}) on {}",
            device.display(),
            mount_point.path().display()
        );

        Ok(MountGuard {
            root: mount_point.path().to_path_buf(),
            mount_point: Some(mount_point),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceId {
    major: u32,
    minor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExistingMount {
    mount_point: PathBuf,
    read_only: bool,
}

fn reuse(
    partition: &Partition,
    existing: ExistingMount,
    mode: MountMode,
) -> io::Result<MountGuard> {
    if mode == MountMode::ReadWrite && existing.read_only {
        return Err(io::Error::new(
            io::ErrorKind::ResourceBusy,
            format!(
                "slot {} is already mounted read-only on {}",
                partition.slot,
                existing.mount_point.display()
            ),
        ));
    }
    debug!(
        "slot {} is already mounted on {}; using it in place",
        partition.slot,
        existing.mount_point.display()
    );
    Ok(MountGuard::borrowed(existing.mount_point))
}

/// First mount of the whole filesystem on `id`, per `/proc/self/mountinfo`.
///
/// Bind mounts of subdirectories are skipped since they don't expose the full tree.
fn find_mount(mountinfo: &str, id: DeviceId) -> Option<ExistingMount> {
    mountinfo.lines().find_map(|line| {
        let mut fields = line.split(' ');
        let dev = fields.nth(2)?;
        let root = fields.next()?;
        let mount_point = fields.next()?;
        let options = fields.next()?;

        let (major, minor) = dev.split_once(':')?;
        let found = DeviceId {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        };
        if found != id || root != "/" {
            return None;
        }
        Some(ExistingMount {
            mount_point: PathBuf::from(unescape(mount_point)),
            read_only: options.split(',').any(|o| o == "ro"),
        })
    })
}

/// Undoes the octal escaping (`\040` for a space) the kernel applies to paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(code) = bytes
                .get(i + 1..i + 4)
                .and_then(|d| std::str::from_utf8(d).ok())
                .and_then(|d| u8::from_str_radix(d, 8).ok())
        {
            out.push(code);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Treats each partition's device path as an already mounted directory tree.
///
/// Used on hosts that mount the partitions themselves, and by the test fixture.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Mounter for Passthrough {
    fn mount(&self, partition: &Partition, _mode: MountMode) -> io::Result<MountGuard> {
        if !partition.device.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "slot {} root {} is not a directory",
                    partition.slot,
                    partition.device.display()
                ),
            ));
        }
        Ok(MountGuard::borrowed(&partition.device))
    }
}

// Opinionated Rust wrapper over mount(2)
fn sys_mount(src: &Path, dst: &Path, fstype: &str, mode: MountMode) -> io::Result<()> {
    let src = CString::new(src.as_os_str().as_bytes())?;
    let dst = CString::new(dst.as_os_str().as_bytes())?;
    let fstype = CString::new(fstype)?;
    let mut flags = libc::MS_NOSUID | libc::MS_NODEV;
    if mode == MountMode::ReadOnly {
        flags |= libc::MS_RDONLY;
    }
    let err = unsafe {
        libc::mount(
            src.as_ptr(),
            dst.as_ptr(),
            fstype.as_ptr(),
            flags,
            std::ptr::null(),
        )
    };

    match err {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

fn sys_umount(path: &Path, lazy: bool) -> io::Result<()> {
    let path = CString::new(path.as_os_str().as_bytes())?;
    let mut flags = libc::UMOUNT_NOFOLLOW;
    if lazy {
        flags |= libc::MNT_DETACH;
    }
    let err = unsafe { libc::umount2(path.as_ptr(), flags) };

    match err {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}
