//! Whole-tree operations on mounted partitions.

use std::{
    collections::HashSet,
    ffi::OsString,
    fs::{self, File},
    io::{self, Read},
    os::unix::fs::{MetadataExt as _, PermissionsExt as _, lchown, symlink},
    path::{Component, Path, PathBuf},
};

use eyre::{Result, WrapErr as _};
use serde::Serialize;
use tracing::debug;

use crate::health::manifest::strip_root;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    pub copied: u64,
    pub unchanged: u64,
    pub removed: u64,
}

/// Paths, relative to a partition root, that tree operations leave alone.
#[derive(Debug, Clone)]
pub struct Excludes(HashSet<PathBuf>);

impl Excludes {
    pub fn new<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) -> Self {
        Self(
            paths
                .into_iter()
                .map(|p| strip_root(p).to_path_buf())
                .collect(),
        )
    }

    fn contains(&self, rel: &Path) -> bool {
        self.0.contains(rel)
    }

    /// Whether `rel` lies strictly inside an excluded tree. The excluded
    /// directory itself is not covered.
    pub fn covers(&self, rel: &Path) -> bool {
        let rel: PathBuf = rel
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.0.iter().any(|e| rel != *e && rel.starts_with(e))
    }
}

/// Makes `dst` an exact copy of `src`: new and changed entries are copied,
/// entries only present in `dst` are deleted. Excluded paths are neither copied
/// nor deleted, but excluded directories are created empty when missing since
/// they usually are mount points. Other filesystems mounted below `src` are
/// treated the same way.
pub fn mirror(src: &Path, dst: &Path, excludes: &Excludes) -> Result<MirrorStats> {
    let mut stats = MirrorStats::default();
    let src_dev = fs::metadata(src)
        .wrap_err_with(|| format!("failed to stat {src:?}"))?
        .dev();
    mirror_dir(src, dst, Path::new(""), src_dev, excludes, &mut stats)?;
    Ok(stats)
}

fn mirror_dir(
    src_root: &Path,
    dst_root: &Path,
    rel: &Path,
    src_dev: u64,
    excludes: &Excludes,
    stats: &mut MirrorStats,
) -> Result<()> {
    let src_dir = src_root.join(rel);
    let dst_dir = dst_root.join(rel);
    let mut seen: HashSet<OsString> = HashSet::new();

    let entries = fs::read_dir(&src_dir)
        .wrap_err_with(|| format!("failed to read {src_dir:?}"))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let entry_rel = rel.join(&name);
        seen.insert(name);

        let src = src_root.join(&entry_rel);
        let dst = dst_root.join(&entry_rel);
        let meta = fs::symlink_metadata(&src)?;
        let file_type = meta.file_type();

        let foreign_mount = file_type.is_dir() && meta.dev() != src_dev;
        if foreign_mount {
            debug!("not crossing into the filesystem mounted on {src:?}");
        }
        if foreign_mount || excludes.contains(&entry_rel) {
            if file_type.is_dir() && fs::symlink_metadata(&dst).is_err() {
                fs::create_dir(&dst)?;
                copy_attributes(&meta, &dst)?;
            }
            continue;
        }

        if file_type.is_dir() {
            match fs::symlink_metadata(&dst) {
                Ok(m) if m.is_dir() => {}
                Ok(_) => {
                    fs::remove_file(&dst)?;
                    fs::create_dir(&dst)?;
                }
                Err(_) => fs::create_dir(&dst)?,
            }
            copy_attributes(&meta, &dst)?;
            mirror_dir(src_root, dst_root, &entry_rel, src_dev, excludes, stats)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&src)?;
            if fs::read_link(&dst).is_ok_and(|existing| existing == target) {
                stats.unchanged += 1;
                continue;
            }
            remove_any(&dst)?;
            symlink(&target, &dst)
                .wrap_err_with(|| format!("failed to create symlink {dst:?}"))?;
            lchown_like(&meta, &dst)?;
            stats.copied += 1;
        } else if file_type.is_file() {
            let unchanged = match fs::symlink_metadata(&dst) {
                Ok(m) if m.is_file() => {
                    m.len() == meta.len() && same_contents(&src, &dst)?
                }
                Ok(_) => {
                    remove_any(&dst)?;
                    false
                }
                Err(_) => false,
            };
            if unchanged {
                stats.unchanged += 1;
            } else {
                fs::copy(&src, &dst)
                    .wrap_err_with(|| format!("failed to copy {src:?} to {dst:?}"))?;
                stats.copied += 1;
            }
            copy_attributes(&meta, &dst)?;
        } else {
            debug!("skipping special file {src:?}");
        }
    }

    for entry in fs::read_dir(&dst_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let entry_rel = rel.join(&name);
        if seen.contains(&name) || excludes.contains(&entry_rel) {
            continue;
        }
        remove_any(&dst_root.join(&entry_rel))?;
        stats.removed += 1;
    }

    Ok(())
}

/// Deletes everything below `root` except excluded paths.
pub fn clear(root: &Path, excludes: &Excludes) -> Result<u64> {
    clear_dir(root, Path::new(""), excludes)
}

fn clear_dir(root: &Path, rel: &Path, excludes: &Excludes) -> Result<u64> {
    let mut removed = 0;
    for entry in fs::read_dir(root.join(rel))? {
        let entry_rel = rel.join(entry?.file_name());
        if excludes.contains(&entry_rel) {
            continue;
        }
        let path = root.join(&entry_rel);
        let is_dir = fs::symlink_metadata(&path)?.is_dir();
        if is_dir && has_excluded_descendant(&entry_rel, excludes) {
            removed += clear_dir(root, &entry_rel, excludes)?;
        } else {
            remove_any(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn has_excluded_descendant(rel: &Path, excludes: &Excludes) -> bool {
    excludes.0.iter().any(|e| e != rel && e.starts_with(rel))
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn copy_attributes(meta: &fs::Metadata, dst: &Path) -> io::Result<()> {
    let mode = meta.permissions().mode();
    if fs::symlink_metadata(dst)?.permissions().mode() != mode {
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    }
    lchown_like(meta, dst)
}

fn lchown_like(meta: &fs::Metadata, dst: &Path) -> io::Result<()> {
    let current = fs::symlink_metadata(dst)?;
    if current.uid() != meta.uid() || current.gid() != meta.gid() {
        lchown(dst, Some(meta.uid()), Some(meta.gid()))?;
    }
    Ok(())
}

fn same_contents(a: &Path, b: &Path) -> io::Result<bool> {
    let mut a = File::open(a)?;
    let mut b = File::open(b)?;
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = a.read(&mut buf_a)?;
        if n == 0 {
            return Ok(b.read(&mut buf_b[..1])? == 0);
        }
        match b.read_exact(&mut buf_b[..n]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e),
        }
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}
