use crate::context::PlanContext;
use crate::step::{ApplyScope, ExecutionError, Findings, StepController, StepKind, ValidationError};
use alpinst_runtime::{bootloader, disk, RuntimeError, Session};
use alpinst_schema::{Filesystem, Firmware, FsType, InstallPlan, Partition, PartitionFlag};

pub struct BootloaderStep;

pub(crate) fn implied(plan: &InstallPlan) -> Vec<&'static str> {
    plan.bootloader()
        .map(bootloader::required_packages)
        .unwrap_or_default()
}

/// Partition carrying `flag` on the boot loader's disk.
fn boot_partition<'a>(plan: &'a InstallPlan, device: &str, flag: PartitionFlag) -> Option<&'a Partition> {
    plan.partitions()
        .find(|(d, p)| d.device == device && p.has_flag(flag))
        .map(|(_, p)| p)
}

fn root_fs_type(plan: &InstallPlan) -> Option<FsType> {
    plan.partitions()
        .flat_map(|(_, p)| p.filesystems())
        .find(|fs| fs.is_root())
        .map(|fs| fs.fs_type)
}

/// `cryptroot`/`cryptdm` arguments when the root filesystem sits inside a
/// LUKS container; empty otherwise.
fn crypt_root_args(
    plan: &InstallPlan,
    session: &Session<'_>,
) -> Result<Vec<String>, RuntimeError> {
    for disk_cfg in plan.disks().unwrap_or_default() {
        for (i, part) in disk_cfg.partitions.iter().enumerate() {
            let Some(enc) = &part.encryption else {
                continue;
            };
            if part.filesystems().any(Filesystem::is_root) {
                let node = disk::partition_device(&disk_cfg.device, i + 1);
                let uuid = disk::filesystem_uuid(session, &node)?;
                return Ok(bootloader::crypt_root_args(&uuid, &enc.name));
            }
        }
    }
    Ok(Vec::new())
}

impl StepController for BootloaderStep {
    fn kind(&self) -> StepKind {
        StepKind::Bootloader
    }

    fn validate(&self, plan: &InstallPlan, ctx: &PlanContext) -> Result<(), Vec<ValidationError>> {
        let mut f = Findings::new(StepKind::Bootloader);
        let Some(cfg) = plan.bootloader() else {
            f.constraint("bootloader", "not answered");
            return f.finish();
        };

        if let Some(disks) = plan.disks() {
            if !disks.iter().any(|d| d.device == cfg.device) {
                f.constraint("device", format!("{} is not one of the planned disks", cfg.device));
            } else {
                match cfg.firmware {
                    Firmware::Efi => {
                        let esp = boot_partition(plan, &cfg.device, PartitionFlag::Esp)
                            .and_then(|p| p.filesystem.as_ref());
                        match esp {
                            None => f.constraint(
                                "firmware",
                                format!("EFI boot needs an esp partition on {}", cfg.device),
                            ),
                            Some(fs) if fs.fs_type != FsType::Vfat || fs.mount_point.is_none() => {
                                f.constraint("firmware", "the esp partition must be a mounted vfat filesystem");
                            }
                            Some(_) => {}
                        }
                    }
                    Firmware::Bios => {
                        if boot_partition(plan, &cfg.device, PartitionFlag::BiosBoot).is_none() {
                            f.constraint(
                                "firmware",
                                format!("BIOS boot on GPT needs a bios_boot partition on {}", cfg.device),
                            );
                        }
                    }
                }
            }
        }

        if bootloader::grub_target(&ctx.host.arch, cfg.firmware).is_none() {
            f.constraint(
                "firmware",
                format!("{} firmware is not supported on {}", cfg.firmware, ctx.host.arch),
            );
        }
        if cfg.secure_boot_shim && cfg.firmware != Firmware::Efi {
            f.constraint("secure_boot_shim", "the Secure Boot shim needs EFI firmware");
        }
        if let Some(console) = &cfg.serial_console {
            if bootloader::parse_serial_console(console).is_none() {
                f.constraint("serial_console", format!("'{console}' is not of the form ttyS0[,baud]"));
            }
        }
        for (i, arg) in cfg.kernel_args.iter().enumerate() {
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('"') {
                f.constraint(format!("kernel_args[{i}]"), format!("'{arg}' must be one word"));
            }
        }
        f.finish()
    }

    fn apply(&mut self, plan: &InstallPlan, scope: &ApplyScope<'_>) -> Result<(), ExecutionError> {
        let fail = |e| ExecutionError::new(StepKind::Bootloader, e);
        let cfg = plan
            .bootloader()
            .ok_or_else(|| ExecutionError::not_answered(StepKind::Bootloader))?;
        let root_fs = root_fs_type(plan)
            .ok_or_else(|| fail(RuntimeError::Config("no root filesystem".to_owned())))?;
        let esp_mount = boot_partition(plan, &cfg.device, PartitionFlag::Esp)
            .and_then(Partition::mount_point);
        let extra_args = crypt_root_args(plan, scope.session).map_err(fail)?;
        bootloader::install(
            scope.session,
            scope.staging,
            cfg,
            &scope.host.arch,
            root_fs,
            esp_mount,
            &extra_args,
        )
        .map_err(fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::fixtures;
    use alpinst_schema::{get_template, load};

    fn validate(plan: &InstallPlan) -> Vec<ValidationError> {
        BootloaderStep
            .validate(plan, &fixtures::context(plan))
            .err()
            .unwrap_or_default()
    }

    #[test]
    fn templates_validate() {
        assert!(validate(&fixtures::efi_plan()).is_empty());
        let bios = load(get_template("bios-ext4").unwrap().plan).unwrap();
        assert!(validate(&bios).is_empty());
    }

    #[test]
    fn device_must_be_planned() {
        let mut plan = fixtures::efi_plan();
        let mut cfg = plan.bootloader().unwrap().clone();
        cfg.device = "/dev/sdz".to_owned();
        plan.set_bootloader(cfg);
        let errs = validate(&plan);
        assert_eq!(errs[0].field, "device");
    }

    #[test]
    fn bios_needs_bios_boot_partition() {
        let mut plan = fixtures::efi_plan();
        let mut cfg = plan.bootloader().unwrap().clone();
        cfg.firmware = Firmware::Bios;
        cfg.secure_boot_shim = true;
        cfg.kernel_args = vec!["quiet splash".to_owned()];
        cfg.serial_console = Some("com1".to_owned());
        plan.set_bootloader(cfg);
        let fields: Vec<String> = validate(&plan).into_iter().map(|e| e.field).collect();
        assert_eq!(fields, ["firmware", "secure_boot_shim", "serial_console", "kernel_args[0]"]);
    }

    #[test]
    fn shim_packages_implied() {
        let mut plan = fixtures::efi_plan();
        let mut cfg = plan.bootloader().unwrap().clone();
        cfg.secure_boot_shim = true;
        plan.set_bootloader(cfg);
        let pkgs = implied(&plan);
        assert!(pkgs.contains(&"shim-signed"));
        assert!(pkgs.contains(&"grub-efi-signed"));
    }
}
