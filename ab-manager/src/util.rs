use std::{fs::File, io::copy, path::Path};

use eyre::WrapErr as _;
use sha2::{Digest as _, Sha256};

/// Hex-encoded sha256 of the file at `path`.
pub fn sha256_file<P: AsRef<Path>>(path: P) -> eyre::Result<String> {
    let display_path = path.as_ref().display();
    let mut hasher = Sha256::new();
    let mut blob = File::open(&path)
        .wrap_err_with(|| format!("failed opening `{display_path}` for hashing"))?;
    copy(&mut blob, &mut hasher)
        .wrap_err_with(|| format!("failed to copy `{display_path}` into hasher"))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello\n")
    const HELLO: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[test]
    fn hashes_files_and_bytes_alike() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello\n").unwrap();

        assert_eq!(sha256_file(&path).unwrap(), HELLO);
        assert_eq!(sha256_bytes(b"hello\n"), HELLO);
        assert!(sha256_file(dir.path().join("missing")).is_err());
    }
}
