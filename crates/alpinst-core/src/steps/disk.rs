//! Disk layout: validation of the declared geometry and storage layers,
//! then partitioning, encryption, volume groups, formatting and mounting
//! under the staging root.

use crate::context::PlanContext;
use crate::step::{
    ApplyScope, CleanupReason, ExecutionError, Findings, StepController, StepKind,
    ValidationError,
};
use alpinst_runtime::disk::{self, CryptVolume, FstabEntry, ALIGNMENT, GPT_RESERVED};
use alpinst_runtime::{target_config, RuntimeError};
use alpinst_schema::{
    ByteSize, Disk, Filesystem, FsType, InstallPlan, Partition, PartitionFlag, VolumeGroup,
};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

const FSTAB: &str = "/etc/fstab";
const DMCRYPT_CONF: &str = "/etc/conf.d/dmcrypt";
const MKINITFS_CONF: &str = "/etc/mkinitfs/mkinitfs.conf";
/// Pseudo filesystems bound into the target so chrooted tools work.
const BIND_MOUNTS: &[&str] = &["/dev", "/proc", "/sys"];

#[derive(Default)]
pub struct DiskStep {
    /// Mounted paths, in mount order.
    mounted: Vec<PathBuf>,
    /// Disks whose partition table this run started rewriting.
    partitioned: Vec<String>,
    /// Opened LUKS volumes, by mapper name.
    opened: Vec<String>,
    /// Active volume groups created by this run.
    activated: Vec<String>,
}

pub(crate) fn implied(plan: &InstallPlan) -> Vec<&'static str> {
    let mut pkgs: Vec<&'static str> = plan
        .filesystem_types()
        .into_iter()
        .filter_map(disk::fs_package)
        .collect();
    if plan.uses_encryption() {
        pkgs.extend(["cryptsetup", "cryptsetup-openrc"]);
    }
    if plan.uses_lvm() {
        pkgs.push("lvm2");
    }
    pkgs
}

fn is_valid_mount_point(mp: &str) -> bool {
    mp.starts_with('/')
        && !mp.contains(char::is_whitespace)
        && Path::new(mp)
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_)))
}

/// Partition ids and device-mapper names share one alphabet.
fn is_valid_name(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Whether the partition carries the root filesystem, directly or on one of
/// its logical volumes.
fn holds_root(part: &Partition) -> bool {
    part.filesystems().any(Filesystem::is_root)
}

/// Mount points seen so far and whether each sits on an encrypted layer.
#[derive(Default)]
struct MountTable<'a> {
    points: Vec<(&'a str, bool)>,
    roots: usize,
}

/// Label, swap and mount point rules shared by partition and logical volume
/// filesystems.
fn check_filesystem<'a>(
    f: &mut Findings,
    field: &str,
    fs: &'a Filesystem,
    encrypted: bool,
    mounts: &mut MountTable<'a>,
) {
    if let Some(label) = &fs.label {
        let max = disk::max_label_len(fs.fs_type);
        if label.len() > max {
            f.constraint(field, format!("label longer than {max} characters for {}", fs.fs_type));
        }
    }
    match (fs.fs_type, fs.mount_point.as_deref()) {
        (FsType::Swap, Some(_)) => f.constraint(field, "swap takes no mount point"),
        (FsType::Swap, None) => {}
        (_, None) => f.constraint(field, "mount point required"),
        (_, Some(mp)) => {
            if !is_valid_mount_point(mp) {
                f.constraint(field, format!("'{mp}' is not an absolute mount point"));
            } else if mounts.points.iter().any(|(p, _)| *p == mp) {
                f.constraint(field, format!("mount point {mp} used twice"));
            } else {
                mounts.points.push((mp, encrypted));
            }
            if fs.is_root() {
                mounts.roots += 1;
                if mounts.roots > 1 {
                    f.constraint(field, "second root filesystem");
                }
            }
            if mp == "/boot" && encrypted {
                f.constraint(field, "/boot cannot be encrypted");
            }
        }
    }
}

/// Names, sizes and filesystems of one volume group.
fn check_volume_group<'a>(
    f: &mut Findings,
    id: &str,
    vg: &'a VolumeGroup,
    encrypted: bool,
    vg_names: &mut HashSet<&'a str>,
    mounts: &mut MountTable<'a>,
) {
    if !is_valid_name(&vg.name) {
        f.constraint(
            id,
            format!("volume group '{}' must be letters, digits, '-' or '_'", vg.name),
        );
    } else if !vg_names.insert(vg.name.as_str()) {
        f.constraint(id, format!("volume group {} declared twice", vg.name));
    }
    if vg.logical_volumes.is_empty() {
        f.constraint(id, format!("volume group {} has no logical volumes", vg.name));
        return;
    }
    let mut lv_names = HashSet::new();
    let last = vg.logical_volumes.len() - 1;
    for (i, lv) in vg.logical_volumes.iter().enumerate() {
        let field = format!("{}/{}", vg.name, lv.name);
        if !is_valid_name(&lv.name) {
            f.constraint(&field, "logical volume names must be letters, digits, '-' or '_'");
        } else if !lv_names.insert(lv.name.as_str()) {
            f.constraint(&field, "duplicate logical volume");
        }
        match lv.size {
            Some(size) if size.bytes() == 0 => f.constraint(&field, "size must be greater than zero"),
            None if i != last => {
                f.constraint(&field, "only the last logical volume may omit its size");
            }
            _ => {}
        }
        check_filesystem(f, &field, &lv.filesystem, encrypted, mounts);
    }
}

/// Logical volumes must fit the space left once the LUKS header and the LVM
/// metadata are taken from the partition.
fn check_volume_group_space(
    f: &mut Findings,
    part: &Partition,
    vg: &VolumeGroup,
    available: ByteSize,
) {
    let capacity = disk::volume_group_capacity(available, part.encryption.is_some());
    let mut used = ByteSize::from_bytes(0);
    for lv in &vg.logical_volumes {
        let field = format!("{}/{}", vg.name, lv.name);
        let fits = match lv.size {
            Some(size) => {
                used = used
                    .checked_add(disk::extent_size(size))
                    .unwrap_or(ByteSize::from_bytes(u64::MAX));
                used <= capacity
            }
            None => capacity.saturating_sub(used).bytes() >= disk::LVM_EXTENT,
        };
        if !fits {
            f.constraint(field, "exceeds volume group capacity");
            return;
        }
    }
}

/// Geometry of one disk: sizes, fill partition, capacity, and the space
/// each volume group gets.
fn check_geometry(f: &mut Findings, disk: &Disk) {
    if disk.capacity == ByteSize::from_bytes(0) {
        f.constraint(disk.device.clone(), "capacity must be greater than zero");
        return;
    }
    let mut used = GPT_RESERVED;
    let last = disk.partitions.len().saturating_sub(1);
    for (i, part) in disk.partitions.iter().enumerate() {
        let id = part.id.as_str();
        let available = match part.size {
            Some(size) if size.bytes() == 0 => {
                f.constraint(id, "size must be greater than zero");
                continue;
            }
            Some(size) => {
                let aligned = disk::aligned_size(size);
                used = used
                    .checked_add(aligned)
                    .unwrap_or(ByteSize::from_bytes(u64::MAX));
                if used > disk.capacity {
                    f.constraint(id, "exceeds device capacity");
                    return;
                }
                aligned
            }
            None if i != last => {
                f.constraint(id, "only the last partition of a disk may omit its size");
                continue;
            }
            None => {
                let rest = disk.capacity.saturating_sub(used);
                if rest.bytes() < ALIGNMENT {
                    f.constraint(id, "exceeds device capacity");
                    continue;
                }
                rest
            }
        };
        if let Some(vg) = &part.volume_group {
            check_volume_group_space(f, part, vg, available);
        }
    }
}

/// Record the first failure of a cleanup pass and keep going.
fn keep_first(first: &mut Option<RuntimeError>, what: &str, res: Result<(), RuntimeError>) {
    if let Err(e) = res {
        warn!("cannot {what}: {e}");
        first.get_or_insert(e);
    }
}

impl DiskStep {
    /// Create the partition's storage layers and filesystems, returning the
    /// fstab entries for them.
    fn build_partition(
        &mut self,
        scope: &ApplyScope<'_>,
        part: &Partition,
        node: &str,
        dmcrypt: &mut Vec<CryptVolume>,
    ) -> Result<Vec<FstabEntry>, RuntimeError> {
        let session = scope.session;
        if let Some(enc) = &part.encryption {
            disk::encrypt(session, node, enc)?;
            self.opened.push(enc.name.clone());
            if !holds_root(part) {
                dmcrypt.push(CryptVolume {
                    name: enc.name.clone(),
                    uuid: disk::filesystem_uuid(session, node)?,
                });
            }
        }
        let content = disk::content_device(part, node);

        let mut targets: Vec<(String, &Filesystem)> = Vec::new();
        if let Some(fs) = &part.filesystem {
            targets.push((content.clone(), fs));
        }
        if let Some(vg) = &part.volume_group {
            disk::create_volume_group(session, &content, vg)?;
            self.activated.push(vg.name.clone());
            disk::create_logical_volumes(session, vg)?;
            targets.extend(
                vg.logical_volumes
                    .iter()
                    .map(|lv| (disk::logical_volume_device(&vg.name, &lv.name), &lv.filesystem)),
            );
        }

        let mut fstab = Vec::new();
        for (device, fs) in targets {
            disk::format(session, fs, &device)?;
            fstab.push(FstabEntry {
                uuid: disk::filesystem_uuid(session, &device)?,
                mount_point: fs.mount_point.clone(),
                fs_type: fs.fs_type,
                options: fs.options.clone(),
            });
        }
        Ok(fstab)
    }
}

/// Boot-time configuration the storage layers need inside the target.
fn write_layer_config(
    plan: &InstallPlan,
    scope: &ApplyScope<'_>,
    dmcrypt: &[CryptVolume],
) -> Result<(), RuntimeError> {
    let encrypted = plan.uses_encryption();
    let lvm = plan.uses_lvm();
    if !encrypted && !lvm {
        return Ok(());
    }
    let staging = scope.staging;
    staging.write_file(
        MKINITFS_CONF,
        &disk::render_mkinitfs(&plan.filesystem_types(), encrypted, lvm),
        0o644,
    )?;
    if !dmcrypt.is_empty() {
        staging.write_file(DMCRYPT_CONF, &disk::render_dmcrypt(dmcrypt), 0o644)?;
        target_config::enable_service(staging, "dmcrypt", "boot")?;
    }
    if lvm {
        target_config::enable_service(staging, "lvm", "boot")?;
    }
    Ok(())
}

impl StepController for DiskStep {
    fn kind(&self) -> StepKind {
        StepKind::Disk
    }

    fn validate(&self, plan: &InstallPlan, _ctx: &PlanContext) -> Result<(), Vec<ValidationError>> {
        let mut f = Findings::new(StepKind::Disk);
        let Some(disks) = plan.disks() else {
            f.constraint("disks", "not answered");
            return f.finish();
        };
        if disks.is_empty() {
            f.constraint("disks", "no disk declared");
            return f.finish();
        }

        let mut devices = HashSet::new();
        let mut ids = HashSet::new();
        let mut mapper_names = HashSet::new();
        let mut vg_names = HashSet::new();
        let mut mounts = MountTable::default();

        for disk in disks {
            if !disk.device.starts_with("/dev/") || disk.device.len() <= "/dev/".len() {
                f.constraint(disk.device.clone(), "device must be a path under /dev");
            }
            if !devices.insert(disk.device.as_str()) {
                f.constraint(disk.device.clone(), "device declared twice");
            }
            if disk.partitions.is_empty() {
                f.constraint(disk.device.clone(), "no partitions");
                continue;
            }
            check_geometry(&mut f, disk);

            for part in &disk.partitions {
                let id = part.id.as_str();
                if !is_valid_name(id) {
                    f.constraint("id", format!("'{id}' must be letters, digits, '-' or '_'"));
                } else if !ids.insert(id) {
                    f.constraint(id, "duplicate partition id");
                }

                let esp = part.has_flag(PartitionFlag::Esp);
                let bios = part.has_flag(PartitionFlag::BiosBoot);
                if esp && bios {
                    f.constraint(id, "a partition cannot be both esp and bios_boot");
                }
                if bios && part.filesystem.is_some() {
                    f.constraint(id, "a bios_boot partition carries no filesystem");
                }
                if (esp || bios) && (part.encryption.is_some() || part.volume_group.is_some()) {
                    f.constraint(
                        id,
                        "boot firmware partitions cannot be encrypted or hold a volume group",
                    );
                }
                if part.filesystem.is_some() && part.volume_group.is_some() {
                    f.constraint(id, "a partition holds a filesystem or a volume group, not both");
                }

                let encrypted = part.encryption.is_some();
                if let Some(enc) = &part.encryption {
                    if !is_valid_name(&enc.name) {
                        f.constraint(
                            id,
                            format!("mapper name '{}' must be letters, digits, '-' or '_'", enc.name),
                        );
                    } else if !mapper_names.insert(enc.name.as_str()) {
                        f.constraint(id, format!("mapper name {} used twice", enc.name));
                    }
                    if !Path::new(&enc.passphrase_file).is_absolute() {
                        f.constraint(id, "passphrase file must be an absolute path");
                    }
                    if part.filesystem.is_none() && part.volume_group.is_none() {
                        f.constraint(
                            id,
                            "an encrypted partition needs a filesystem or a volume group",
                        );
                    }
                }
                if let Some(vg) = &part.volume_group {
                    check_volume_group(&mut f, id, vg, encrypted, &mut vg_names, &mut mounts);
                }

                let Some(fs) = &part.filesystem else {
                    if esp {
                        f.constraint(id, "the EFI system partition must be vfat");
                    }
                    continue;
                };
                if esp && fs.fs_type != FsType::Vfat {
                    f.constraint(id, "the EFI system partition must be vfat");
                }
                check_filesystem(&mut f, id, fs, encrypted, &mut mounts);
            }
        }
        if mounts.roots == 0 {
            f.constraint("mount_point", "no filesystem is mounted at /");
        }
        let root_encrypted = mounts.points.iter().any(|&(mp, enc)| mp == "/" && enc);
        let plain_boot = mounts.points.iter().any(|&(mp, enc)| mp == "/boot" && !enc);
        if root_encrypted && !plain_boot {
            f.constraint("mount_point", "an encrypted root needs an unencrypted /boot filesystem");
        }
        f.finish()
    }

    fn apply(&mut self, plan: &InstallPlan, scope: &ApplyScope<'_>) -> Result<(), ExecutionError> {
        let fail = |e| ExecutionError::new(StepKind::Disk, e);
        let disks = plan
            .disks()
            .ok_or_else(|| ExecutionError::not_answered(StepKind::Disk))?;
        let staging = scope.staging;
        let session = scope.session;

        let aside = staging.set_aside().map_err(fail)?;

        for d in disks {
            let actual = disk::verify_capacity(session, d).map_err(fail)?;
            debug!("{}: {actual} bytes", d.device);
        }

        let mut fstab = Vec::new();
        let mut dmcrypt = Vec::new();
        for d in disks {
            self.partitioned.push(d.device.clone());
            let nodes = disk::write_partition_table(session, d).map_err(fail)?;
            for (part, node) in d.partitions.iter().zip(&nodes) {
                let entries = self
                    .build_partition(scope, part, node, &mut dmcrypt)
                    .map_err(fail)?;
                fstab.extend(entries);
            }
        }

        for m in disk::mount_order(disks) {
            let target = staging.resolve(m.mount_point).map_err(fail)?;
            info!("mounting {} on {}", m.device, target.display());
            disk::mount(session, m.filesystem, &m.device, &target).map_err(fail)?;
            self.mounted.push(target);
        }

        if let Some(aside) = aside {
            staging.adopt(&aside).map_err(fail)?;
        }

        for source in BIND_MOUNTS {
            let target = staging.resolve(source).map_err(fail)?;
            disk::bind_mount(session, source, &target).map_err(fail)?;
            self.mounted.push(target);
        }

        staging
            .write_file(FSTAB, &disk::render_fstab(&fstab), 0o644)
            .map_err(fail)?;
        write_layer_config(plan, scope, &dmcrypt).map_err(fail)
    }

    /// Unmount everything this step mounted, deepest first, then deactivate
    /// its volume groups and close its LUKS volumes. An aborted run also
    /// wipes the partition tables it wrote. Keeps going after a failure and
    /// reports the first one.
    fn cleanup(
        &mut self,
        _plan: &InstallPlan,
        scope: &ApplyScope<'_>,
        reason: CleanupReason,
    ) -> Result<(), RuntimeError> {
        let session = scope.session;
        let mut first_err = None;
        while let Some(target) = self.mounted.pop() {
            let what = format!("unmount {}", target.display());
            keep_first(&mut first_err, &what, disk::unmount(session, &target));
        }
        while let Some(vg) = self.activated.pop() {
            let what = format!("deactivate volume group {vg}");
            keep_first(&mut first_err, &what, disk::deactivate_volume_group(session, &vg));
        }
        while let Some(name) = self.opened.pop() {
            let what = format!("close {name}");
            keep_first(&mut first_err, &what, disk::close_encrypted(session, &name));
        }
        let partitioned = std::mem::take(&mut self.partitioned);
        if reason == CleanupReason::Aborted {
            for device in partitioned.iter().rev() {
                info!("wiping partition table of {device}");
                let what = format!("wipe {device}");
                keep_first(&mut first_err, &what, disk::wipe_signatures(session, device));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
