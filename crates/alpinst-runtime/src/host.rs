//! Facts about the machine running the installer.

use alpinst_schema::{ByteSize, Firmware, LibcVariant};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What the validators need to know about the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFacts {
    pub libc: LibcVariant,
    /// Alpine architecture name (`x86_64`, `aarch64`, ...).
    pub arch: String,
    pub firmware: Firmware,
}

impl HostFacts {
    pub fn detect(arch_override: Option<&str>) -> Self {
        let facts = Self {
            libc: detect_libc(Path::new("/")),
            arch: arch_override.map_or_else(detect_arch, str::to_owned),
            firmware: detect_firmware(Path::new("/")),
        };
        debug!(
            "host: libc={} arch={} firmware={}",
            facts.libc, facts.arch, facts.firmware
        );
        facts
    }
}

/// A musl system carries its dynamic loader as `/lib/ld-musl-<arch>.so.1`.
pub fn detect_libc(root: &Path) -> LibcVariant {
    let Ok(entries) = std::fs::read_dir(root.join("lib")) else {
        return LibcVariant::Glibc;
    };
    let musl = entries
        .flatten()
        .any(|e| e.file_name().to_string_lossy().starts_with("ld-musl-"));
    if musl {
        LibcVariant::Musl
    } else {
        LibcVariant::Glibc
    }
}

pub fn detect_arch() -> String {
    match std::env::consts::ARCH {
        "x86" => "x86".to_owned(),
        "arm" => "armv7".to_owned(),
        "powerpc64" => "ppc64le".to_owned(),
        other => other.to_owned(),
    }
}

pub fn detect_firmware(root: &Path) -> Firmware {
    if root.join("sys/firmware/efi").exists() {
        Firmware::Efi
    } else {
        Firmware::Bios
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub size: ByteSize,
    pub model: Option<String>,
}

/// Whole-disk block devices under `<sys_root>/block`, skipping loop, ram,
/// zram and optical devices.
pub fn list_block_devices(sys_root: &Path) -> Vec<BlockDevice> {
    let Ok(entries) = std::fs::read_dir(sys_root.join("block")) else {
        return Vec::new();
    };
    let mut devices: Vec<BlockDevice> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            if ["loop", "ram", "zram", "sr", "fd"]
                .iter()
                .any(|p| name.starts_with(p))
            {
                return None;
            }
            let dir = e.path();
            let sectors: u64 = std::fs::read_to_string(dir.join("size"))
                .ok()?
                .trim()
                .parse()
                .ok()?;
            if sectors == 0 {
                return None;
            }
            let model = std::fs::read_to_string(dir.join("device/model"))
                .ok()
                .map(|m| m.trim().to_owned())
                .filter(|m| !m.is_empty());
            Some(BlockDevice {
                path: PathBuf::from("/dev").join(&name),
                size: ByteSize::from_bytes(sectors * 512),
                model,
            })
        })
        .collect();
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}
