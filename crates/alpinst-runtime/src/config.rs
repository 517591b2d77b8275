//! Installer configuration.
//!
//! Everything the engine needs to know about the installation medium lives
//! here and is passed into the engine explicitly: where the target is
//! staged, where signing keys and `apk` binaries live for each C library,
//! and how long each step may run.

use crate::RuntimeError;
use alpinst_schema::LibcVariant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/alpinst/installer.toml";
pub const CONFIG_ENV: &str = "ALPINST_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    /// Mount point of the target root during installation.
    pub staging_root: PathBuf,
    /// Holds one subdirectory of `*.pub` signing keys per C library.
    pub keys_dir: PathBuf,
    pub package_manager: PackageManagerPaths,
    /// Installed on every target in addition to the plan's packages.
    pub base_packages: Vec<String>,
    /// Copy the setup record into the installed system.
    pub copy_record: bool,
    /// Location of the setup record inside the target.
    pub record_path: PathBuf,
    pub lock_file: PathBuf,
    /// Overrides the detected host architecture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    pub timeouts: Timeouts,
}

/// Statically linked `apk` binaries, one per target C library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageManagerPaths {
    pub musl: PathBuf,
    pub glibc: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub default_secs: u64,
    /// Per-step overrides keyed by step name.
    pub steps: BTreeMap<String, u64>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("/mnt/target_root"),
            keys_dir: PathBuf::from("/usr/share/alpinst/keys"),
            package_manager: PackageManagerPaths::default(),
            base_packages: vec!["alpine-base".to_owned(), "linux-lts".to_owned()],
            copy_record: true,
            record_path: PathBuf::from("/root/alpinst-setup.toml"),
            lock_file: PathBuf::from("/run/alpinst.lock"),
            arch: None,
            timeouts: Timeouts::default(),
        }
    }
}

impl Default for PackageManagerPaths {
    fn default() -> Self {
        Self {
            musl: PathBuf::from("/usr/lib/alpinst/musl/apk.static"),
            glibc: PathBuf::from("/usr/lib/alpinst/glibc/apk.static"),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default_secs: 900,
            steps: BTreeMap::from([("packages".to_owned(), 3600)]),
        }
    }
}

impl PackageManagerPaths {
    pub fn for_variant(&self, variant: LibcVariant) -> &Path {
        match variant {
            LibcVariant::Musl => &self.musl,
            LibcVariant::Glibc => &self.glibc,
        }
    }
}

impl Timeouts {
    pub fn for_step(&self, step: &str) -> Duration {
        Duration::from_secs(self.steps.get(step).copied().unwrap_or(self.default_secs))
    }
}

impl InstallerConfig {
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| RuntimeError::Config(format!("invalid {}: {e}", path.display())))
    }

    /// `ALPINST_CONFIG`, then the system-wide file, then built-in defaults.
    pub fn load_default() -> Result<Self, RuntimeError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let system = Path::new(DEFAULT_CONFIG_PATH);
        if system.exists() {
            return Self::load(system);
        }
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<(), RuntimeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RuntimeError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Keys for one C library: `<keys_dir>/<variant>`.
    pub fn keys_for(&self, variant: LibcVariant) -> PathBuf {
        self.keys_dir.join(variant.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installer.toml");
        let mut config = InstallerConfig {
            staging_root: dir.path().join("target"),
            ..InstallerConfig::default()
        };
        config.timeouts.steps.insert("disk".to_owned(), 120);
        config.save(&path).unwrap();
        assert_eq!(InstallerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installer.toml");
        std::fs::write(&path, "keys_dir = \"/opt/keys\"\n[timeouts]\ndefault_secs = 60\n").unwrap();
        let config = InstallerConfig::load(&path).unwrap();
        assert_eq!(config.keys_dir, Path::new("/opt/keys"));
        assert_eq!(config.staging_root, Path::new("/mnt/target_root"));
        assert_eq!(config.timeouts.for_step("disk"), Duration::from_secs(60));
        assert_eq!(config.timeouts.for_step("packages"), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installer.toml");
        std::fs::write(&path, "staging = \"/x\"\n").unwrap();
        assert!(matches!(
            InstallerConfig::load(&path),
            Err(RuntimeError::Config(_))
        ));
    }

    #[test]
    fn per_step_timeout_overrides_default() {
        let t = Timeouts::default();
        assert_eq!(t.for_step("packages"), Duration::from_secs(3600));
        assert_eq!(t.for_step("keyboard"), Duration::from_secs(900));
    }

    #[test]
    fn paths_follow_variant() {
        let config = InstallerConfig::default();
        assert_eq!(
            config.keys_for(LibcVariant::Glibc),
            Path::new("/usr/share/alpinst/keys/glibc")
        );
        assert!(config
            .package_manager
            .for_variant(LibcVariant::Musl)
            .starts_with("/usr/lib/alpinst/musl"));
    }
}
