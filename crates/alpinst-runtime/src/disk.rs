//! Partitioning, encryption, volume groups, formatting and mounting.
//!
//! Command construction is kept in pure functions so the exact tool calls
//! can be checked without touching a device; the `Session`-taking functions
//! run them.
//!
//! A partition holds either a filesystem or an LVM volume group, optionally
//! inside a LUKS2 container: partition, then `cryptsetup`, then LVM, then
//! the filesystem.

use crate::command::{Invocation, Session};
use crate::RuntimeError;
use alpinst_schema::{
    ByteSize, Disk, Encryption, Filesystem, FsType, LogicalVolume, Partition, PartitionFlag,
    VolumeGroup, MIB,
};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Partition start and size granularity.
pub const ALIGNMENT: u64 = MIB;
/// Space kept free for the primary and backup GPT headers.
pub const GPT_RESERVED: ByteSize = ByteSize::mib(2);
/// How long to wait for partition device nodes after repartitioning.
pub const PARTITION_NODE_WAIT: Duration = Duration::from_secs(10);

/// Space `cryptsetup luksFormat --type luks2` takes for its header.
pub const LUKS_HEADER: ByteSize = ByteSize::mib(16);
/// Space `pvcreate` keeps ahead of the first extent.
pub const LVM_METADATA: ByteSize = ByteSize::mib(1);
/// Default LVM physical extent size.
pub const LVM_EXTENT: u64 = 4 * MIB;

const BIOS_BOOT_GUID: &str = "21686148-6F49-4E6F-744E-656564454649";

/// Device node of the `index`-th (1-based) partition of `disk`.
pub fn partition_device(disk: &str, index: usize) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{disk}p{index}")
    } else {
        format!("{disk}{index}")
    }
}

pub fn mapper_device(name: &str) -> String {
    format!("/dev/mapper/{name}")
}

pub fn logical_volume_device(vg: &str, lv: &str) -> String {
    format!("/dev/{vg}/{lv}")
}

/// Device holding a partition's contents: the opened LUKS volume when the
/// partition is encrypted, the partition node otherwise.
pub fn content_device(part: &Partition, node: &str) -> String {
    part.encryption
        .as_ref()
        .map_or_else(|| node.to_owned(), |e| mapper_device(&e.name))
}

/// Space a partition occupies once aligned.
pub fn aligned_size(size: ByteSize) -> ByteSize {
    size.align_up(ALIGNMENT)
}

/// Longest label each filesystem accepts.
pub fn max_label_len(fs: FsType) -> usize {
    match fs {
        FsType::Ext4 => 16,
        FsType::Xfs => 12,
        FsType::Vfat => 11,
        FsType::Swap => 15,
        FsType::Btrfs => 255,
    }
}

/// Package providing the `mkfs` tool for a filesystem inside the target.
pub fn fs_package(fs: FsType) -> Option<&'static str> {
    match fs {
        FsType::Ext4 => Some("e2fsprogs"),
        FsType::Xfs => Some("xfsprogs"),
        FsType::Btrfs => Some("btrfs-progs"),
        FsType::Vfat => Some("dosfstools"),
        FsType::Swap => None,
    }
}

fn partition_type(part: &Partition) -> &'static str {
    if part.has_flag(PartitionFlag::Esp) {
        "U"
    } else if part.has_flag(PartitionFlag::BiosBoot) {
        BIOS_BOOT_GUID
    } else if part.encryption.is_none()
        && part
            .filesystem
            .as_ref()
            .is_some_and(|f| f.fs_type == FsType::Swap)
    {
        "S"
    } else if part.encryption.is_none() && part.volume_group.is_some() {
        "V"
    } else {
        "L"
    }
}

/// Usable bytes of a partition of `size` once the LUKS header and the LVM
/// metadata are taken, rounded down to whole extents.
pub fn volume_group_capacity(size: ByteSize, encrypted: bool) -> ByteSize {
    let mut usable = size.saturating_sub(LVM_METADATA);
    if encrypted {
        usable = usable.saturating_sub(LUKS_HEADER);
    }
    ByteSize::from_bytes(usable.bytes() / LVM_EXTENT * LVM_EXTENT)
}

/// Space a logical volume takes once rounded up to whole extents.
pub fn extent_size(size: ByteSize) -> ByteSize {
    size.align_up(LVM_EXTENT)
}

/// sfdisk input creating a fresh GPT with the disk's partitions in order.
pub fn sfdisk_script(disk: &Disk) -> String {
    let mut script = String::from("label: gpt\n");
    for part in &disk.partitions {
        let mut line = String::new();
        if let Some(size) = part.size {
            let _ = write!(line, "size={}MiB, ", aligned_size(size).bytes() / MIB);
        }
        let _ = write!(line, "type={}, name={}", partition_type(part), part.id);
        script.push_str(&line);
        script.push('\n');
    }
    script
}

pub fn partition_table_invocation(disk: &Disk) -> Invocation {
    Invocation::new("sfdisk")
        .args(["--wipe", "always", "--wipe-partitions", "always", "--no-reread"])
        .arg(&disk.device)
        .stdin(sfdisk_script(disk))
}

pub fn mkfs_invocation(fs: &Filesystem, device: &str) -> Invocation {
    let (tool, force, label_flag): (&str, &[&str], &str) = match fs.fs_type {
        FsType::Ext4 => ("mkfs.ext4", &["-F"], "-L"),
        FsType::Xfs => ("mkfs.xfs", &["-f"], "-L"),
        FsType::Btrfs => ("mkfs.btrfs", &["-f"], "-L"),
        FsType::Vfat => ("mkfs.vfat", &["-F", "32"], "-n"),
        FsType::Swap => ("mkswap", &[], "-L"),
    };
    let mut inv = Invocation::new(tool).args(force.iter().copied());
    if let Some(label) = &fs.label {
        inv = inv.arg(label_flag).arg(label);
    }
    inv.arg(device)
}

/// First line of the passphrase file, without its line ending.
pub fn read_passphrase(path: &Path) -> Result<String, RuntimeError> {
    let text = std::fs::read_to_string(path)?;
    let line = text.lines().next().unwrap_or_default();
    if line.is_empty() {
        return Err(RuntimeError::Config(format!(
            "passphrase file {} is empty",
            path.display()
        )));
    }
    Ok(line.to_owned())
}

/// `cryptsetup` reads one passphrase line from a non-terminal stdin.
pub fn luks_format_invocation(node: &str, passphrase: &str) -> Invocation {
    Invocation::new("cryptsetup")
        .args(["luksFormat", "--batch-mode", "--type", "luks2", node])
        .stdin(format!("{passphrase}\n"))
}

pub fn luks_open_invocation(node: &str, encryption: &Encryption, passphrase: &str) -> Invocation {
    Invocation::new("cryptsetup")
        .args(["open", "--type", "luks", node, encryption.name.as_str()])
        .stdin(format!("{passphrase}\n"))
}

pub fn luks_close_invocation(name: &str) -> Invocation {
    Invocation::new("cryptsetup").args(["close", name])
}

pub fn pvcreate_invocation(device: &str) -> Invocation {
    Invocation::new("pvcreate").args(["--yes", device])
}

pub fn vgcreate_invocation(vg: &str, device: &str) -> Invocation {
    Invocation::new("vgcreate").args([vg, device])
}

pub fn lvcreate_invocation(vg: &str, lv: &LogicalVolume) -> Invocation {
    let inv = Invocation::new("lvcreate").args(["--yes", "-n", lv.name.as_str()]);
    let inv = match lv.size {
        Some(size) => inv.arg("-L").arg(format!("{}m", extent_size(size).bytes() / MIB)),
        None => inv.args(["-l", "100%FREE"]),
    };
    inv.arg(vg)
}

pub fn vg_deactivate_invocation(vg: &str) -> Invocation {
    Invocation::new("vgchange").args(["-an", vg])
}

pub fn mount_invocation(fs: &Filesystem, device: &str, target: &Path) -> Invocation {
    let mut inv = Invocation::new("mount").args(["-t", fs.fs_type.as_str()]);
    if !fs.options.is_empty() {
        inv = inv.arg("-o").arg(fs.options.join(","));
    }
    inv.arg(device).arg(target.to_string_lossy())
}

/// A filesystem to mount under the staging root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMount<'a> {
    pub device: String,
    pub mount_point: &'a str,
    pub filesystem: &'a Filesystem,
}

/// Every filesystem of the plan with the device it lives on.
pub fn filesystem_devices(disks: &[Disk]) -> Vec<(String, &Filesystem)> {
    let mut out = Vec::new();
    for d in disks {
        for (i, p) in d.partitions.iter().enumerate() {
            let content = content_device(p, &partition_device(&d.device, i + 1));
            if let Some(fs) = &p.filesystem {
                out.push((content.clone(), fs));
            }
            if let Some(vg) = &p.volume_group {
                for lv in &vg.logical_volumes {
                    out.push((logical_volume_device(&vg.name, &lv.name), &lv.filesystem));
                }
            }
        }
    }
    out
}

/// Mountable filesystems ordered so that parents mount before children.
pub fn mount_order(disks: &[Disk]) -> Vec<PlannedMount<'_>> {
    let mut mounts: Vec<PlannedMount<'_>> = filesystem_devices(disks)
        .into_iter()
        .filter(|(_, fs)| fs.fs_type != FsType::Swap)
        .filter_map(|(device, fs)| {
            Some(PlannedMount {
                device,
                mount_point: fs.mount_point.as_deref()?,
                filesystem: fs,
            })
        })
        .collect();
    mounts.sort_by_key(|m| {
        (
            Path::new(m.mount_point).components().count(),
            m.mount_point.to_owned(),
        )
    });
    mounts
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub uuid: String,
    pub mount_point: Option<String>,
    pub fs_type: FsType,
    pub options: Vec<String>,
}

pub fn render_fstab(entries: &[FstabEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let mount_point = e.mount_point.as_deref().unwrap_or("none");
        let options = if e.options.is_empty() {
            "defaults".to_owned()
        } else {
            e.options.join(",")
        };
        let pass = match (e.fs_type, mount_point) {
            (FsType::Swap, _) => 0,
            (_, "/") => 1,
            _ => 2,
        };
        let _ = writeln!(
            out,
            "UUID={}\t{mount_point}\t{}\t{options}\t0 {pass}",
            e.uuid, e.fs_type
        );
    }
    out
}

/// A LUKS volume opened at boot by the `dmcrypt` service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptVolume {
    pub name: String,
    /// UUID of the LUKS container on the partition.
    pub uuid: String,
}

/// `/etc/conf.d/dmcrypt`: one `target`/`source` pair per volume.
pub fn render_dmcrypt(volumes: &[CryptVolume]) -> String {
    let mut out = String::from("dmcrypt_key_timeout=1\ndmcrypt_max_timeout=300\ndmcrypt_retries=5\n");
    for v in volumes {
        let _ = write!(out, "\ntarget={}\nsource=UUID={}\n", v.name, v.uuid);
    }
    out
}

/// `/etc/mkinitfs/mkinitfs.conf` with the features the root device needs.
pub fn render_mkinitfs(filesystems: &[FsType], encrypted: bool, lvm: bool) -> String {
    let mut features = vec!["ata", "base", "ide", "scsi", "usb", "virtio"];
    for fs in filesystems {
        if *fs != FsType::Swap && !features.contains(&fs.as_str()) {
            features.push(fs.as_str());
        }
    }
    if encrypted {
        features.extend(["cryptsetup", "keymap"]);
    }
    if lvm {
        features.push("lvm");
    }
    format!("features=\"{}\"\n", features.join(" "))
}

/// Fail unless the device is at least as large as the plan declares.
pub fn verify_capacity(session: &Session<'_>, disk: &Disk) -> Result<u64, RuntimeError> {
    let out = session.run(
        &Invocation::new("blockdev")
            .arg("--getsize64")
            .arg(&disk.device),
    )?;
    let actual: u64 = out
        .stdout
        .trim()
        .parse()
        .map_err(|_| RuntimeError::UnexpectedOutput {
            program: "blockdev".to_owned(),
            detail: out.stdout.trim().to_owned(),
        })?;
    if actual < disk.capacity.bytes() {
        return Err(RuntimeError::DeviceTooSmall {
            device: disk.device.clone(),
            declared: disk.capacity.bytes(),
            actual,
        });
    }
    Ok(actual)
}

/// Write a new partition table and wait for every partition node.
pub fn write_partition_table(
    session: &Session<'_>,
    disk: &Disk,
) -> Result<Vec<String>, RuntimeError> {
    info!("partitioning {}", disk.device);
    session.run(&partition_table_invocation(disk))?;
    session.run(&Invocation::new("partx").args(["-u", disk.device.as_str()]))?;
    let nodes: Vec<String> = (1..=disk.partitions.len())
        .map(|i| partition_device(&disk.device, i))
        .collect();
    for node in &nodes {
        session.wait_for_path(Path::new(node), PARTITION_NODE_WAIT)?;
    }
    Ok(nodes)
}

/// Destroy the partition table of a disk.
pub fn wipe_signatures(session: &Session<'_>, device: &str) -> Result<(), RuntimeError> {
    session.run(&Invocation::new("wipefs").args(["--all", device]))?;
    Ok(())
}

pub fn format(session: &Session<'_>, fs: &Filesystem, device: &str) -> Result<(), RuntimeError> {
    debug!("formatting {device} as {}", fs.fs_type);
    session.run(&mkfs_invocation(fs, device))?;
    Ok(())
}

pub fn filesystem_uuid(session: &Session<'_>, device: &str) -> Result<String, RuntimeError> {
    let out = session.run(&Invocation::new("blkid").args([
        "-c",
        "/dev/null",
        "-o",
        "value",
        "-s",
        "UUID",
        device,
    ]))?;
    let uuid = out.stdout.trim();
    if uuid.is_empty() {
        return Err(RuntimeError::UnexpectedOutput {
            program: "blkid".to_owned(),
            detail: format!("no UUID for {device}"),
        });
    }
    Ok(uuid.to_owned())
}

pub fn mount(
    session: &Session<'_>,
    fs: &Filesystem,
    device: &str,
    target: &Path,
) -> Result<(), RuntimeError> {
    std::fs::create_dir_all(target)?;
    session.run(&mount_invocation(fs, device, target))?;
    Ok(())
}

pub fn bind_mount(session: &Session<'_>, source: &str, target: &Path) -> Result<(), RuntimeError> {
    std::fs::create_dir_all(target)?;
    session.run(
        &Invocation::new("mount")
            .arg("--bind")
            .arg(source)
            .arg(target.to_string_lossy()),
    )?;
    Ok(())
}

pub fn unmount(session: &Session<'_>, target: &Path) -> Result<(), RuntimeError> {
    session.run(&Invocation::new("umount").arg(target.to_string_lossy()))?;
    Ok(())
}

/// Create the LUKS container on `node` and open it.
pub fn encrypt(
    session: &Session<'_>,
    node: &str,
    encryption: &Encryption,
) -> Result<(), RuntimeError> {
    let passphrase = read_passphrase(Path::new(&encryption.passphrase_file))?;
    info!("encrypting {node} as {}", encryption.name);
    session.run(&luks_format_invocation(node, &passphrase))?;
    session.run(&luks_open_invocation(node, encryption, &passphrase))?;
    Ok(())
}

pub fn close_encrypted(session: &Session<'_>, name: &str) -> Result<(), RuntimeError> {
    session.run(&luks_close_invocation(name))?;
    Ok(())
}

/// Make `device` the single physical volume of a new, active group.
pub fn create_volume_group(
    session: &Session<'_>,
    device: &str,
    vg: &VolumeGroup,
) -> Result<(), RuntimeError> {
    info!("creating volume group {} on {device}", vg.name);
    session.run(&pvcreate_invocation(device))?;
    session.run(&vgcreate_invocation(&vg.name, device))?;
    Ok(())
}

/// Carve the group's logical volumes out of it in plan order.
pub fn create_logical_volumes(session: &Session<'_>, vg: &VolumeGroup) -> Result<(), RuntimeError> {
    for lv in &vg.logical_volumes {
        session.run(&lvcreate_invocation(&vg.name, lv))?;
    }
    Ok(())
}

pub fn deactivate_volume_group(session: &Session<'_>, vg: &str) -> Result<(), RuntimeError> {
    session.run(&vg_deactivate_invocation(vg))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alpinst_schema::PartitionId;

    fn part(id: &str, size: Option<ByteSize>, flags: Vec<PartitionFlag>, fs: Option<Filesystem>) -> Partition {
        Partition {
            id: PartitionId::new(id),
            size,
            flags,
            encryption: None,
            filesystem: fs,
            volume_group: None,
        }
    }

    fn layered_disk() -> Disk {
        let mut root = part("root", None, vec![], None);
        root.encryption = Some(Encryption {
            name: "cryptroot".to_owned(),
            passphrase_file: "/run/pass".to_owned(),
        });
        root.volume_group = Some(VolumeGroup {
            name: "vg0".to_owned(),
            logical_volumes: vec![
                LogicalVolume {
                    name: "root".to_owned(),
                    size: Some(ByteSize::gib(8)),
                    filesystem: fs(FsType::Ext4, Some("/")),
                },
                LogicalVolume {
                    name: "swap".to_owned(),
                    size: Some(ByteSize::from_bytes(1)),
                    filesystem: fs(FsType::Swap, None),
                },
                LogicalVolume {
                    name: "home".to_owned(),
                    size: None,
                    filesystem: fs(FsType::Xfs, Some("/home")),
                },
            ],
        });
        Disk {
            device: "/dev/sda".to_owned(),
            capacity: ByteSize::gib(20),
            partitions: vec![
                part("boot", Some(ByteSize::gib(1)), vec![], Some(fs(FsType::Ext4, Some("/boot")))),
                root,
            ],
        }
    }

    fn fs(fs_type: FsType, mount_point: Option<&str>) -> Filesystem {
        Filesystem {
            fs_type,
            mount_point: mount_point.map(str::to_owned),
            label: None,
            options: vec![],
        }
    }

    fn sample_disk() -> Disk {
        Disk {
            device: "/dev/nvme0n1".to_owned(),
            capacity: ByteSize::gib(20),
            partitions: vec![
                part(
                    "esp",
                    Some(ByteSize::mib(512)),
                    vec![PartitionFlag::Esp],
                    Some(fs(FsType::Vfat, Some("/boot/efi"))),
                ),
                part("swap", Some(ByteSize::from_bytes(1000)), vec![], Some(fs(FsType::Swap, None))),
                part("root", None, vec![], Some(fs(FsType::Ext4, Some("/")))),
            ],
        }
    }

    #[test]
    fn partition_device_names() {
        assert_eq!(partition_device("/dev/sda", 1), "/dev/sda1");
        assert_eq!(partition_device("/dev/vdb", 3), "/dev/vdb3");
        assert_eq!(partition_device("/dev/nvme0n1", 2), "/dev/nvme0n1p2");
        assert_eq!(partition_device("/dev/mmcblk0", 1), "/dev/mmcblk0p1");
    }

    #[test]
    fn sfdisk_script_aligns_and_types() {
        let script = sfdisk_script(&sample_disk());
        let lines: Vec<_> = script.lines().collect();
        assert_eq!(lines[0], "label: gpt");
        assert_eq!(lines[1], "size=512MiB, type=U, name=esp");
        assert_eq!(lines[2], "size=1MiB, type=S, name=swap");
        assert_eq!(lines[3], "type=L, name=root");
    }

    #[test]
    fn bios_boot_uses_guid() {
        let disk = Disk {
            device: "/dev/sda".to_owned(),
            capacity: ByteSize::gib(8),
            partitions: vec![part("bios", Some(ByteSize::mib(1)), vec![PartitionFlag::BiosBoot], None)],
        };
        assert!(sfdisk_script(&disk).contains(BIOS_BOOT_GUID));
    }

    #[test]
    fn partition_table_wipes_existing_signatures() {
        let inv = partition_table_invocation(&sample_disk());
        assert_eq!(inv.program, "sfdisk");
        assert!(inv.args.windows(2).any(|w| w == ["--wipe", "always"]));
        assert_eq!(inv.args.last().unwrap(), "/dev/nvme0n1");
        assert!(inv.stdin.as_deref().unwrap().starts_with("label: gpt"));
    }

    #[test]
    fn mkfs_per_filesystem() {
        let mut f = fs(FsType::Vfat, Some("/boot/efi"));
        f.label = Some("EFI".to_owned());
        assert_eq!(
            mkfs_invocation(&f, "/dev/sda1").display(),
            "mkfs.vfat -F 32 -n EFI /dev/sda1"
        );
        assert_eq!(
            mkfs_invocation(&fs(FsType::Ext4, Some("/")), "/dev/sda2").display(),
            "mkfs.ext4 -F /dev/sda2"
        );
        assert_eq!(
            mkfs_invocation(&fs(FsType::Swap, None), "/dev/sda3").display(),
            "mkswap /dev/sda3"
        );
        assert_eq!(
            mkfs_invocation(&fs(FsType::Xfs, Some("/")), "/dev/sda2").display(),
            "mkfs.xfs -f /dev/sda2"
        );
    }

    #[test]
    fn mount_passes_options() {
        let mut f = fs(FsType::Btrfs, Some("/"));
        f.options = vec!["compress=zstd".to_owned(), "noatime".to_owned()];
        assert_eq!(
            mount_invocation(&f, "/dev/sda2", Path::new("/mnt/t")).display(),
            "mount -t btrfs -o compress=zstd,noatime /dev/sda2 /mnt/t"
        );
    }

    #[test]
    fn mounts_parents_first_and_skip_swap() {
        let mut disk = sample_disk();
        disk.partitions.push(part("home", Some(ByteSize::gib(1)), vec![], Some(fs(FsType::Ext4, Some("/home")))));
        let disks = [disk];
        let order: Vec<_> = mount_order(&disks).iter().map(|m| m.mount_point).collect();
        assert_eq!(order, ["/", "/home", "/boot/efi"]);
        let root = &mount_order(&disks)[0];
        assert_eq!(root.device, "/dev/nvme0n1p3");
    }

    #[test]
    fn layered_devices_and_mounts() {
        let disks = [layered_disk()];
        let devices: Vec<_> = filesystem_devices(&disks).into_iter().map(|(d, _)| d).collect();
        assert_eq!(devices, ["/dev/sda1", "/dev/vg0/root", "/dev/vg0/swap", "/dev/vg0/home"]);
        let order: Vec<_> = mount_order(&disks)
            .into_iter()
            .map(|m| (m.mount_point, m.device))
            .collect();
        assert_eq!(
            order,
            [
                ("/", "/dev/vg0/root".to_owned()),
                ("/boot", "/dev/sda1".to_owned()),
                ("/home", "/dev/vg0/home".to_owned()),
            ]
        );
        let mut plain = layered_disk();
        plain.partitions[1].volume_group = None;
        plain.partitions[1].filesystem = Some(fs(FsType::Ext4, Some("/")));
        assert_eq!(mount_order(&[plain])[0].device, "/dev/mapper/cryptroot");
    }

    #[test]
    fn luks_and_lvm_commands() {
        let enc = Encryption {
            name: "cryptroot".to_owned(),
            passphrase_file: "/run/pass".to_owned(),
        };
        let format = luks_format_invocation("/dev/sda2", "hunter2");
        assert_eq!(
            format.display(),
            "cryptsetup luksFormat --batch-mode --type luks2 /dev/sda2"
        );
        assert_eq!(format.stdin.as_deref(), Some("hunter2\n"));
        assert_eq!(
            luks_open_invocation("/dev/sda2", &enc, "hunter2").display(),
            "cryptsetup open --type luks /dev/sda2 cryptroot"
        );
        assert_eq!(luks_close_invocation("cryptroot").display(), "cryptsetup close cryptroot");

        let disk = layered_disk();
        let vg = disk.partitions[1].volume_group.as_ref().unwrap();
        assert_eq!(
            lvcreate_invocation("vg0", &vg.logical_volumes[0]).display(),
            "lvcreate --yes -n root -L 8192m vg0"
        );
        assert_eq!(
            lvcreate_invocation("vg0", &vg.logical_volumes[1]).display(),
            "lvcreate --yes -n swap -L 4m vg0"
        );
        assert_eq!(
            lvcreate_invocation("vg0", &vg.logical_volumes[2]).display(),
            "lvcreate --yes -n home -l 100%FREE vg0"
        );
        assert_eq!(vg_deactivate_invocation("vg0").display(), "vgchange -an vg0");
    }

    #[test]
    fn passphrase_is_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, "correct horse\nignored\n").unwrap();
        assert_eq!(read_passphrase(&path).unwrap(), "correct horse");
        std::fs::write(&path, "\n").unwrap();
        assert!(matches!(read_passphrase(&path), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn volume_group_space_after_headers() {
        assert_eq!(volume_group_capacity(ByteSize::gib(1), false), ByteSize::mib(1020));
        assert_eq!(volume_group_capacity(ByteSize::gib(1), true), ByteSize::mib(1004));
        assert_eq!(extent_size(ByteSize::mib(5)), ByteSize::mib(8));
        assert_eq!(volume_group_capacity(ByteSize::mib(10), true), ByteSize::from_bytes(0));
    }

    #[test]
    fn lvm_partition_type_and_initramfs_features() {
        let mut disk = layered_disk();
        assert!(sfdisk_script(&disk).ends_with("type=L, name=root\n"));
        disk.partitions[1].encryption = None;
        assert!(sfdisk_script(&disk).ends_with("type=V, name=root\n"));
        assert_eq!(
            render_mkinitfs(&[FsType::Ext4, FsType::Swap, FsType::Xfs], true, true),
            "features=\"ata base ide scsi usb virtio ext4 xfs cryptsetup keymap lvm\"\n"
        );
    }

    #[test]
    fn dmcrypt_lists_volumes() {
        let text = render_dmcrypt(&[CryptVolume {
            name: "cryptdata".to_owned(),
            uuid: "abcd".to_owned(),
        }]);
        assert!(text.starts_with("dmcrypt_key_timeout=1\n"));
        assert!(text.ends_with("\ntarget=cryptdata\nsource=UUID=abcd\n"));
    }

    #[test]
    fn fstab_pass_numbers() {
        let fstab = render_fstab(&[
            FstabEntry {
                uuid: "r".to_owned(),
                mount_point: Some("/".to_owned()),
                fs_type: FsType::Ext4,
                options: vec![],
            },
            FstabEntry {
                uuid: "e".to_owned(),
                mount_point: Some("/boot/efi".to_owned()),
                fs_type: FsType::Vfat,
                options: vec!["umask=0077".to_owned()],
            },
            FstabEntry {
                uuid: "s".to_owned(),
                mount_point: None,
                fs_type: FsType::Swap,
                options: vec![],
            },
        ]);
        let lines: Vec<_> = fstab.lines().collect();
        assert_eq!(lines[0], "UUID=r\t/\text4\tdefaults\t0 1");
        assert_eq!(lines[1], "UUID=e\t/boot/efi\tvfat\tumask=0077\t0 2");
        assert_eq!(lines[2], "UUID=s\tnone\tswap\tdefaults\t0 0");
    }

    #[test]
    fn label_limits_and_packages() {
        assert_eq!(max_label_len(FsType::Vfat), 11);
        assert_eq!(fs_package(FsType::Xfs), Some("xfsprogs"));
        assert_eq!(fs_package(FsType::Swap), None);
    }
}
