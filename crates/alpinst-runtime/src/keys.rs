//! Package signing keys, organized by C library.
//!
//! The key directory holds one subdirectory per variant (`musl/`, `glibc/`)
//! of PEM public keys named as `apk` expects them
//! (`<maintainer>-<id>.rsa.pub`). Keys are only ever looked up by the
//! target's variant.

use crate::staging::StagingRoot;
use crate::RuntimeError;
use alpinst_schema::LibcVariant;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Trust store of `apk` inside the target.
pub const TARGET_KEYS_DIR: &str = "/etc/apk/keys";

const PEM_MARKER: &str = "BEGIN PUBLIC KEY";

/// Key file names available per variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyInventory {
    sets: BTreeMap<LibcVariant, Vec<String>>,
}

impl KeyInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `<keys_dir>/<variant>/*.pub` for every variant. A missing
    /// subdirectory simply means no keys for that variant.
    pub fn scan(keys_dir: &Path) -> Result<Self, RuntimeError> {
        let mut inv = Self::new();
        for variant in LibcVariant::ALL {
            let dir = keys_dir.join(variant.as_str());
            if dir.is_dir() {
                inv.sets.insert(variant, list_key_files(&dir)?);
            }
        }
        Ok(inv)
    }

    pub fn insert(&mut self, variant: LibcVariant, names: Vec<String>) {
        self.sets.insert(variant, names);
    }

    pub fn keys(&self, variant: LibcVariant) -> &[String] {
        self.sets.get(&variant).map_or(&[], Vec::as_slice)
    }

    pub fn has_key(&self, variant: LibcVariant, name: &str) -> bool {
        self.keys(variant).iter().any(|k| k == name)
    }
}

fn list_key_files(dir: &Path) -> Result<Vec<String>, RuntimeError> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".pub"))
        .collect();
    names.sort();
    Ok(names)
}

/// Copy the target variant's keys into the staging root's trust store.
/// Returns the installed file names.
pub fn install_keys(
    keys_dir: &Path,
    variant: LibcVariant,
    staging: &StagingRoot,
) -> Result<Vec<String>, RuntimeError> {
    let source = keys_dir.join(variant.as_str());
    let names = if source.is_dir() {
        list_key_files(&source)?
    } else {
        Vec::new()
    };
    if names.is_empty() {
        return Err(RuntimeError::KeysMissing {
            variant: variant.to_string(),
            dir: source.display().to_string(),
        });
    }

    let dest = staging.create_dir(TARGET_KEYS_DIR)?;
    for name in &names {
        let content = fs::read_to_string(source.join(name))?;
        if !content.contains(PEM_MARKER) {
            return Err(RuntimeError::InvalidKey(name.clone()));
        }
        fs::write(dest.join(name), content)?;
    }
    info!("installed {} {variant} signing keys", names.len());
    Ok(names)
}

/// Trust store path on the host side, for `apk --keys-dir`.
pub fn trust_store(staging: &StagingRoot) -> Result<PathBuf, RuntimeError> {
    staging.resolve(TARGET_KEYS_DIR)
}
