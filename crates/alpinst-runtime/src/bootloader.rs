//! GRUB installation into the staging root.

use crate::command::{Invocation, Session};
use crate::staging::StagingRoot;
use crate::RuntimeError;
use alpinst_schema::{BootloaderConfig, Firmware, FsType};
use std::fmt::Write as _;
use tracing::info;

pub const DEFAULT_GRUB: &str = "/etc/default/grub";
const GRUB_CFG: &str = "/boot/grub/grub.cfg";
const DEFAULT_BAUD: u32 = 115_200;

/// A serial console such as `ttyS0,115200`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConsole {
    pub device: String,
    pub unit: u32,
    pub baud: u32,
}

pub fn parse_serial_console(spec: &str) -> Option<SerialConsole> {
    let (device, baud) = match spec.split_once(',') {
        Some((d, b)) => (d, b.parse().ok()?),
        None => (spec, DEFAULT_BAUD),
    };
    let unit = device
        .strip_prefix("ttyS")
        .or_else(|| device.strip_prefix("ttyAMA"))?
        .parse()
        .ok()?;
    Some(SerialConsole {
        device: device.to_owned(),
        unit,
        baud,
    })
}

/// `grub-install --target` for an architecture and firmware, if supported.
pub fn grub_target(arch: &str, firmware: Firmware) -> Option<&'static str> {
    match (firmware, arch) {
        (Firmware::Efi, "x86_64") => Some("x86_64-efi"),
        (Firmware::Efi, "x86") => Some("i386-efi"),
        (Firmware::Efi, "aarch64") => Some("arm64-efi"),
        (Firmware::Efi, "riscv64") => Some("riscv64-efi"),
        (Firmware::Bios, "x86_64" | "x86") => Some("i386-pc"),
        _ => None,
    }
}

/// Packages the boot loader needs inside the target.
pub fn required_packages(config: &BootloaderConfig) -> Vec<&'static str> {
    let mut pkgs = vec!["grub"];
    match config.firmware {
        Firmware::Efi => pkgs.extend(["grub-efi", "efibootmgr"]),
        Firmware::Bios => pkgs.push("grub-bios"),
    }
    if config.secure_boot_shim {
        pkgs.extend([
            "sbsigntool",
            "efitools",
            "mokutil",
            "shim-signed",
            "grub-efi-signed",
        ]);
    }
    pkgs
}

/// Kernel arguments that let the initramfs unlock an encrypted root.
pub fn crypt_root_args(luks_uuid: &str, mapper_name: &str) -> Vec<String> {
    vec![
        format!("cryptroot=UUID={luks_uuid}"),
        format!("cryptdm={mapper_name}"),
    ]
}

/// `extra_args` come from the disk layout and precede the plan's own.
pub fn render_default_grub(
    config: &BootloaderConfig,
    root_fs: FsType,
    extra_args: &[String],
) -> String {
    let mut cmdline = format!(
        "modules=sd-mod,usb-storage,{root_fs} quiet rootfstype={root_fs}"
    );
    for arg in extra_args.iter().chain(&config.kernel_args) {
        cmdline.push(' ');
        cmdline.push_str(arg);
    }
    let serial = config
        .serial_console
        .as_deref()
        .and_then(parse_serial_console);
    if let Some(s) = &serial {
        let _ = write!(cmdline, " console={},{}", s.device, s.baud);
    }

    let mut out = String::from("GRUB_TIMEOUT=2\nGRUB_DISABLE_SUBMENU=y\nGRUB_DISABLE_RECOVERY=true\n");
    let _ = writeln!(out, "GRUB_CMDLINE_LINUX_DEFAULT=\"{cmdline}\"");
    if let Some(s) = &serial {
        out.push_str("GRUB_TERMINAL=\"serial console\"\n");
        let _ = writeln!(
            out,
            "GRUB_SERIAL_COMMAND=\"serial --unit={} --speed={}\"",
            s.unit, s.baud
        );
    }
    out
}

pub fn install_invocation(
    staging: &StagingRoot,
    config: &BootloaderConfig,
    target: &str,
    esp_mount: Option<&str>,
) -> Invocation {
    let mut inv = Invocation::chroot(staging.path(), "grub-install")
        .arg(format!("--target={target}"));
    match config.firmware {
        Firmware::Efi => {
            inv = inv
                .arg(format!("--efi-directory={}", esp_mount.unwrap_or("/boot/efi")))
                .args(["--bootloader-id=alpine", "--removable", "--no-nvram"]);
        }
        Firmware::Bios => inv = inv.arg(&config.device),
    }
    inv
}

pub fn install(
    session: &Session<'_>,
    staging: &StagingRoot,
    config: &BootloaderConfig,
    arch: &str,
    root_fs: FsType,
    esp_mount: Option<&str>,
    extra_args: &[String],
) -> Result<(), RuntimeError> {
    let target = grub_target(arch, config.firmware).ok_or_else(|| {
        RuntimeError::Config(format!(
            "no grub target for {arch} with {} firmware",
            config.firmware
        ))
    })?;
    staging.write_file(
        DEFAULT_GRUB,
        &render_default_grub(config, root_fs, extra_args),
        0o644,
    )?;
    info!("installing grub ({target}) for {}", config.device);
    session.run(&install_invocation(staging, config, target, esp_mount))?;
    session.run(
        &Invocation::chroot(staging.path(), "grub-mkconfig").args(["-o", GRUB_CFG]),
    )?;
    Ok(())
}
