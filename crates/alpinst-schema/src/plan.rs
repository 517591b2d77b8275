//! The install plan: one sub-record per installation domain.
//!
//! Every sub-record starts out unset (`None`). Front-ends fill a plan through
//! the `set_*` methods, each of which replaces a whole sub-record at once, and
//! step controllers read it through the matching accessors. An unset
//! sub-record is distinct from an explicitly empty one: `users()` returns
//! `None` before the question was answered and `Some(&[])` when the answer
//! was "no accounts".

use crate::size::ByteSize;
use crate::types::{PackageName, PartitionId};
use crate::variant::LibcVariant;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyboardLayout {
    /// Keymap layout code, e.g. `us` or `de`.
    pub layout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_variant: Option<String>,
    /// POSIX locale, e.g. `en_US.UTF-8`.
    pub locale: String,
    /// `Region/City` or `UTC`. Unset leaves the target on UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMethod {
    Dhcp,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Interface {
    pub name: String,
    pub method: AddressMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
    Swap,
}

impl FsType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
            Self::Vfat => "vfat",
            Self::Swap => "swap",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filesystem {
    #[serde(rename = "type")]
    pub fs_type: FsType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Filesystem {
    pub fn is_root(&self) -> bool {
        self.mount_point.as_deref() == Some("/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionFlag {
    /// EFI system partition.
    Esp,
    /// GRUB core image slot on BIOS/GPT systems.
    BiosBoot,
}

/// LUKS2 container around a partition's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Encryption {
    /// Device-mapper name; the opened volume is `/dev/mapper/<name>`.
    pub name: String,
    /// File on the installation host whose first line is the passphrase.
    /// The passphrase itself never enters the plan.
    pub passphrase_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogicalVolume {
    pub name: String,
    /// `None` takes the free space left in the volume group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<ByteSize>,
    pub filesystem: Filesystem,
}

/// An LVM volume group whose single physical volume is the partition
/// (or its opened LUKS container).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeGroup {
    pub name: String,
    #[serde(default)]
    pub logical_volumes: Vec<LogicalVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Partition {
    pub id: PartitionId,
    /// `None` fills the rest of the disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<PartitionFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<Encryption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<Filesystem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_group: Option<VolumeGroup>,
}

impl Partition {
    pub fn has_flag(&self, flag: PartitionFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn mount_point(&self) -> Option<&str> {
        self.filesystem.as_ref()?.mount_point.as_deref()
    }

    /// The partition's own filesystem, then those of its logical volumes.
    pub fn filesystems(&self) -> impl Iterator<Item = &Filesystem> {
        self.filesystem.iter().chain(
            self.volume_group
                .iter()
                .flat_map(|vg| vg.logical_volumes.iter().map(|lv| &lv.filesystem)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    /// Block device path. Never inferred; always named by the plan.
    pub device: String,
    /// Declared device capacity. Checked against the real device before
    /// anything is written.
    pub capacity: ByteSize,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorSelection {
    pub url: String,
    /// Signing key set used to trust the mirror.
    pub key_set: LibcVariant,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_repositories: Vec<String>,
}

impl MirrorSelection {
    /// Primary mirror first, then extra repositories in declaration order.
    pub fn repositories(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.extra_repositories.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSelection {
    /// C library of the system being installed.
    pub libc: LibcVariant,
    #[serde(default)]
    pub names: Vec<PackageName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Efi,
    Bios,
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Efi => "efi",
            Self::Bios => "bios",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootloaderConfig {
    /// Disk receiving the boot loader; must be one of the planned disks.
    pub device: String,
    pub firmware: Firmware,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secure_boot_shim: bool,
    /// Serial console such as `ttyS0,115200`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_console: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserAccount {
    pub name: String,
    /// crypt(3) hash as stored in `/etc/shadow`.
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gecos: Option<String>,
    /// Member of `wheel` with sudo rights.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub admin: bool,
}

/// Names of the plan's sub-records, in install order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Keyboard,
    Network,
    Disks,
    Mirror,
    Packages,
    Bootloader,
    Users,
}

impl Section {
    pub const ALL: [Section; 7] = [
        Section::Keyboard,
        Section::Network,
        Section::Disks,
        Section::Mirror,
        Section::Packages,
        Section::Bootloader,
        Section::Users,
    ];

    /// Key of the section in a plan file.
    pub fn key(self) -> &'static str {
        match self {
            Self::Keyboard => "keyboard",
            Self::Network => "network",
            Self::Disks => "disks",
            Self::Mirror => "mirror",
            Self::Packages => "packages",
            Self::Bootloader => "bootloader",
            Self::Users => "users",
        }
    }

    /// Whether a plan file must carry this section. `users` may be omitted.
    pub fn required(self) -> bool {
        !matches!(self, Self::Users)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Snapshot of one sub-record, kept next to a step's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "section", content = "value", rename_all = "lowercase")]
pub enum PlanSlice {
    Keyboard(Option<KeyboardLayout>),
    Network(Option<NetworkConfig>),
    Disks(Option<Vec<Disk>>),
    Mirror(Option<MirrorSelection>),
    Packages(Option<PackageSelection>),
    Bootloader(Option<BootloaderConfig>),
    Users(Option<Vec<UserAccount>>),
}

impl PlanSlice {
    pub fn is_set(&self) -> bool {
        match self {
            Self::Keyboard(v) => v.is_some(),
            Self::Network(v) => v.is_some(),
            Self::Disks(v) => v.is_some(),
            Self::Mirror(v) => v.is_some(),
            Self::Packages(v) => v.is_some(),
            Self::Bootloader(v) => v.is_some(),
            Self::Users(v) => v.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    keyboard: Option<KeyboardLayout>,
    network: Option<NetworkConfig>,
    disks: Option<Vec<Disk>>,
    mirror: Option<MirrorSelection>,
    packages: Option<PackageSelection>,
    bootloader: Option<BootloaderConfig>,
    users: Option<Vec<UserAccount>>,
}

impl InstallPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyboard(&self) -> Option<&KeyboardLayout> {
        self.keyboard.as_ref()
    }

    pub fn set_keyboard(&mut self, keyboard: KeyboardLayout) {
        self.keyboard = Some(keyboard);
    }

    pub fn network(&self) -> Option<&NetworkConfig> {
        self.network.as_ref()
    }

    pub fn set_network(&mut self, network: NetworkConfig) {
        self.network = Some(network);
    }

    pub fn disks(&self) -> Option<&[Disk]> {
        self.disks.as_deref()
    }

    pub fn set_disks(&mut self, disks: Vec<Disk>) {
        self.disks = Some(disks);
    }

    pub fn mirror(&self) -> Option<&MirrorSelection> {
        self.mirror.as_ref()
    }

    pub fn set_mirror(&mut self, mirror: MirrorSelection) {
        self.mirror = Some(mirror);
    }

    pub fn packages(&self) -> Option<&PackageSelection> {
        self.packages.as_ref()
    }

    pub fn set_packages(&mut self, packages: PackageSelection) {
        self.packages = Some(packages);
    }

    pub fn bootloader(&self) -> Option<&BootloaderConfig> {
        self.bootloader.as_ref()
    }

    pub fn set_bootloader(&mut self, bootloader: BootloaderConfig) {
        self.bootloader = Some(bootloader);
    }

    pub fn users(&self) -> Option<&[UserAccount]> {
        self.users.as_deref()
    }

    pub fn set_users(&mut self, users: Vec<UserAccount>) {
        self.users = Some(users);
    }

    /// Target C library, if the package selection has been answered.
    pub fn target_libc(&self) -> Option<LibcVariant> {
        self.packages.as_ref().map(|p| p.libc)
    }

    /// Every partition of every disk, paired with its disk, in plan order.
    pub fn partitions(&self) -> impl Iterator<Item = (&Disk, &Partition)> {
        self.disks
            .iter()
            .flatten()
            .flat_map(|d| d.partitions.iter().map(move |p| (d, p)))
    }

    /// Every planned filesystem type, in plan order, without duplicates.
    /// Filesystems on logical volumes count.
    pub fn filesystem_types(&self) -> Vec<FsType> {
        let mut out = Vec::new();
        for fs in self.partitions().flat_map(|(_, p)| p.filesystems()) {
            if !out.contains(&fs.fs_type) {
                out.push(fs.fs_type);
            }
        }
        out
    }

    /// Whether any partition is a LUKS container.
    pub fn uses_encryption(&self) -> bool {
        self.partitions().any(|(_, p)| p.encryption.is_some())
    }

    /// Whether any partition carries an LVM volume group.
    pub fn uses_lvm(&self) -> bool {
        self.partitions().any(|(_, p)| p.volume_group.is_some())
    }

    pub fn is_set(&self, section: Section) -> bool {
        self.slice(section).is_set()
    }

    pub fn missing_sections(&self) -> Vec<Section> {
        Section::ALL
            .into_iter()
            .filter(|s| !self.is_set(*s))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_sections().is_empty()
    }

    pub fn slice(&self, section: Section) -> PlanSlice {
        match section {
            Section::Keyboard => PlanSlice::Keyboard(self.keyboard.clone()),
            Section::Network => PlanSlice::Network(self.network.clone()),
            Section::Disks => PlanSlice::Disks(self.disks.clone()),
            Section::Mirror => PlanSlice::Mirror(self.mirror.clone()),
            Section::Packages => PlanSlice::Packages(self.packages.clone()),
            Section::Bootloader => PlanSlice::Bootloader(self.bootloader.clone()),
            Section::Users => PlanSlice::Users(self.users.clone()),
        }
    }
}
