//! The checksum manifest shipped inside every partition image.

use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    /// Paths relative to the partition root, mapped to their hex sha256.
    pub files: BTreeMap<PathBuf, String>,
}

/// A manifest together with the digest of its raw bytes.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest: Manifest,
    pub digest: String,
}

impl Manifest {
    pub fn load(root: &Path, manifest_path: &Path) -> eyre::Result<LoadedManifest> {
        let path = root.join(strip_root(manifest_path));
        let raw = fs::read(&path)
            .map_err(|e| eyre::eyre!("failed to read manifest {path:?}: {e}"))?;
        let manifest = serde_json::from_slice(&raw)
            .map_err(|e| eyre::eyre!("failed to parse manifest {path:?}: {e}"))?;
        Ok(LoadedManifest {
            manifest,
            digest: util::sha256_bytes(&raw),
        })
    }

    /// Returns one message per entry whose on-disk content doesn't match.
    pub fn verify(&self, root: &Path) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|(rel, expected)| {
                let path = root.join(strip_root(rel));
                match util::sha256_file(&path) {
                    Ok(actual) if actual.eq_ignore_ascii_case(expected) => None,
                    Ok(actual) => Some(format!(
                        "checksum mismatch for {}: expected {expected}, got {actual}",
                        rel.display()
                    )),
                    Err(e) => Some(format!("cannot verify {}: {e:#}", rel.display())),
                }
            })
            .collect()
    }
}

/// Configured paths may be written as absolute paths of the running system.
pub(crate) fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}
