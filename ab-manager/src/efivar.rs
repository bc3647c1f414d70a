//! Minimal access to the efivars filesystem.
//! [efivar Documentation](https://www.kernel.org/doc/html/latest/filesystems/efivarfs.html)

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use eyre::{Result, WrapErr, bail, eyre};
use rustix::fs::IFlags;

const EFIVARS_PATH: &str = "sys/firmware/efi/efivars/";

#[derive(Debug, Clone)]
pub struct EfiVarDb {
    path: PathBuf,
}

impl EfiVarDb {
    /// Returns an [`EfiVarDb`] for the given rootfs.
    pub fn from_rootfs(rootfs_path: impl AsRef<Path>) -> Result<Self> {
        let path = rootfs_path.as_ref().join(EFIVARS_PATH);
        let path = fs::canonicalize(&path)
            .map_err(|e| eyre!("failed to canonicalize efivars path {path:?}: {e}"))?;

        Ok(Self { path })
    }

    pub fn get_var(&self, name: impl AsRef<Path>) -> Result<EfiVar> {
        let name = name.as_ref();
        if name.is_absolute() {
            bail!("efivar path cannot be absolute. Given '{name:?}'");
        }

        Ok(EfiVar {
            path: self.path.join(name),
        })
    }
}

/// A single variable. Its contents are `[4 bytes attributes][n bytes value]`.
#[derive(Debug, Clone)]
pub struct EfiVar {
    path: PathBuf,
}

impl EfiVar {
    pub fn read(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).wrap_err_with(|| format!("failed to read {:?}", self.path))
    }

    /// Creates the variable if it does not exist, or entirely replaces its contents.
    ///
    /// Variables are usually immutable; the flag is cleared for the write and restored.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let err = |msg| move || format!("failed to {msg} {:?}", self.path);

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return fs::write(&self.path, data).wrap_err_with(err("write to file"));
            }
            Err(e) => return Err(e).wrap_err_with(err("open file")),
        };

        let Some(original) = read_flags(&file).wrap_err_with(err("read inode flags"))?
        else {
            return fs::write(&self.path, data).wrap_err_with(err("write to file"));
        };

        rustix::fs::ioctl_setflags(&file, without_immutable(&original))
            .map_err(io::Error::from)
            .wrap_err_with(err("make file mutable"))?;
        let written = fs::write(&self.path, data).wrap_err_with(err("write to file"));
        rustix::fs::ioctl_setflags(&file, original)
            .map_err(io::Error::from)
            .wrap_err_with(err("restore inode flags"))?;

        written
    }
}

fn without_immutable(flags: &IFlags) -> IFlags {
    IFlags::from_bits_retain(flags.bits() & !IFlags::IMMUTABLE.bits())
}

/// `None` when the filesystem has no notion of inode flags.
fn read_flags(file: &File) -> io::Result<Option<IFlags>> {
    match rustix::fs::ioctl_getflags(file) {
        Ok(flags) => Ok(Some(flags)),
        Err(rustix::io::Errno::NOTTY | rustix::io::Errno::OPNOTSUPP) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_create_and_replace_variables() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join(EFIVARS_PATH)).unwrap();
        let db = EfiVarDb::from_rootfs(root.path()).unwrap();
        let var = db.get_var("Test-1234").unwrap();

        var.write(&[0x07, 0, 0, 0, 1, 0, 0, 0]).unwrap();
        assert_eq!(var.read().unwrap(), vec![0x07, 0, 0, 0, 1, 0, 0, 0]);
        var.write(&[0x07, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(var.read().unwrap(), vec![0x07, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn only_the_immutable_flag_is_cleared() {
        let flags = IFlags::IMMUTABLE | IFlags::NOATIME;

        let mutable = without_immutable(&flags);

        assert_eq!(mutable.bits(), IFlags::NOATIME.bits());
        assert_eq!(flags.bits(), (IFlags::IMMUTABLE | IFlags::NOATIME).bits());
    }

    #[test]
    fn absolute_names_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join(EFIVARS_PATH)).unwrap();
        let db = EfiVarDb::from_rootfs(root.path()).unwrap();
        assert!(db.get_var("/etc/passwd").is_err());
    }
}
