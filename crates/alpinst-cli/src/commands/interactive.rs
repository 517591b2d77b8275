//! Guided installation.
//!
//! Questions are asked one step at a time, in apply order. After each step
//! the answers are checked with that step's validator and the questions are
//! asked again until the step is valid, so the plan handed to the engine at
//! the end has already passed every check once.

use super::{check_prereqs, execute, load_config, write_atomic, Target, EXIT_CANCELLED};
use alpinst_core::{Engine, PlanContext, StepKind};
use alpinst_runtime::accounts::hash_password;
use alpinst_runtime::host::list_block_devices;
use alpinst_runtime::target_config::KEYMAPS;
use alpinst_runtime::{HostFacts, HostRunner};
use alpinst_schema::{
    dump, AddressMethod, BootloaderConfig, ByteSize, Disk, Filesystem, Firmware, FsType,
    InstallPlan, Interface, KeyboardLayout, LibcVariant, MirrorSelection, NetworkConfig,
    PackageName, PackageSelection, Partition, PartitionFlag, PartitionId, UserAccount,
};
use console::Style;
use dialoguer::{Confirm, Input, Password, Select};
use std::io::{stderr, stdin, IsTerminal};
use std::path::Path;

const MAIN_REPO: &str = "https://dl-cdn.alpinelinux.org/alpine/latest-stable/main";
const COMMUNITY_REPO: &str = "https://dl-cdn.alpinelinux.org/alpine/latest-stable/community";
const ROOT_FILESYSTEMS: [FsType; 3] = [FsType::Ext4, FsType::Xfs, FsType::Btrfs];

fn prompt_err(e: dialoguer::Error) -> String {
    format!("prompt failed: {e}")
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_owned())
}

fn words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_owned).collect()
}

fn ask_text(prompt: &str, default: &str) -> Result<String, String> {
    Input::new()
        .with_prompt(prompt)
        .default(default.to_owned())
        .interact_text()
        .map_err(prompt_err)
}

fn ask_optional(prompt: &str, initial: &str) -> Result<String, String> {
    Input::new()
        .with_prompt(prompt)
        .allow_empty(true)
        .with_initial_text(initial)
        .interact_text()
        .map_err(prompt_err)
}

fn ask_size(prompt: &str, allow_empty: bool) -> Result<Option<ByteSize>, String> {
    let text: String = Input::new()
        .with_prompt(prompt)
        .allow_empty(allow_empty)
        .validate_with(move |s: &String| -> Result<(), String> {
            if allow_empty && s.trim().is_empty() {
                return Ok(());
            }
            s.trim().parse::<ByteSize>().map(|_| ()).map_err(|e| e.to_string())
        })
        .interact_text()
        .map_err(prompt_err)?;
    match non_empty(text) {
        Some(t) => t.parse::<ByteSize>().map(Some).map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

struct Questionnaire<'a> {
    engine: &'a Engine,
    plan: InstallPlan,
    ctx: PlanContext,
    host: HostFacts,
}

impl<'a> Questionnaire<'a> {
    fn new(engine: &'a Engine) -> Self {
        let plan = InstallPlan::new();
        let ctx = engine.gather_context(&plan);
        let host = ctx.host.clone();
        Self {
            engine,
            plan,
            ctx,
            host,
        }
    }

    fn heading(title: &str) {
        eprintln!("\n{}", Style::new().bold().apply_to(title));
    }

    /// Ask until `kind` validates. Mirror answers change what the later
    /// validators know, so the context is gathered again after them.
    fn answer(
        &mut self,
        kind: StepKind,
        ask: fn(&mut Self) -> Result<(), String>,
    ) -> Result<(), String> {
        Self::heading(kind.name());
        loop {
            ask(self)?;
            if kind == StepKind::Mirror {
                self.ctx = self.engine.gather_context(&self.plan);
            }
            match self.engine.validate_step(kind, &self.plan, &self.ctx) {
                Ok(()) => return Ok(()),
                Err(errors) => {
                    let red = Style::new().red();
                    for e in &errors {
                        eprintln!("  {} {e}", red.apply_to("✗"));
                    }
                    eprintln!("please correct the answers above");
                }
            }
        }
    }

    fn run(&mut self) -> Result<InstallPlan, String> {
        self.answer(StepKind::Keyboard, Self::ask_keyboard)?;
        self.answer(StepKind::Network, Self::ask_network)?;
        self.answer(StepKind::Disk, Self::ask_disks)?;
        self.answer(StepKind::Mirror, Self::ask_mirror)?;
        self.answer(StepKind::Packages, Self::ask_packages)?;
        self.answer(StepKind::Bootloader, Self::ask_bootloader)?;
        self.answer(StepKind::Users, Self::ask_users)?;
        Ok(self.plan.clone())
    }

    fn ask_keyboard(&mut self) -> Result<(), String> {
        let current = self.plan.keyboard().cloned();
        let layout = current.as_ref().map_or("us", |k| k.layout.as_str());
        let idx = Select::new()
            .with_prompt("keyboard layout")
            .items(KEYMAPS)
            .default(KEYMAPS.iter().position(|k| *k == layout).unwrap_or(0))
            .interact()
            .map_err(prompt_err)?;
        let variant = ask_optional(
            "layout variant (empty for none)",
            current
                .as_ref()
                .and_then(|k| k.layout_variant.as_deref())
                .unwrap_or_default(),
        )?;
        let locale = ask_text(
            "locale",
            current.as_ref().map_or("en_US.UTF-8", |k| k.locale.as_str()),
        )?;
        let timezone = ask_text(
            "timezone",
            current
                .as_ref()
                .and_then(|k| k.timezone.as_deref())
                .unwrap_or("UTC"),
        )?;
        self.plan.set_keyboard(KeyboardLayout {
            layout: KEYMAPS[idx].to_owned(),
            layout_variant: non_empty(variant),
            locale,
            timezone: non_empty(timezone),
        });
        Ok(())
    }

    fn ask_network(&mut self) -> Result<(), String> {
        let current = self.plan.network().cloned();
        let hostname = ask_text(
            "hostname",
            current.as_ref().map_or("alpine", |n| n.hostname.as_str()),
        )?;
        let name = ask_text("network interface", "eth0")?;
        let idx = Select::new()
            .with_prompt("address configuration")
            .items(&["dhcp", "static"])
            .default(0)
            .interact()
            .map_err(prompt_err)?;
        let interface = if idx == 0 {
            Interface {
                name,
                method: AddressMethod::Dhcp,
                address: None,
                prefix: None,
                gateway: None,
            }
        } else {
            let address = ask_text("IPv4 address", "")?;
            let prefix: u8 = Input::new()
                .with_prompt("prefix length")
                .default(24)
                .interact_text()
                .map_err(prompt_err)?;
            let gateway = ask_optional("gateway (empty for none)", "")?;
            Interface {
                name,
                method: AddressMethod::Static,
                address: Some(address),
                prefix: Some(prefix),
                gateway: non_empty(gateway),
            }
        };
        let dns = ask_optional(
            "DNS servers (space-separated, empty for none)",
            &current.as_ref().map(|n| n.dns.join(" ")).unwrap_or_default(),
        )?;
        let proxy = ask_optional(
            "HTTP proxy (empty for none)",
            current
                .as_ref()
                .and_then(|n| n.proxy.as_deref())
                .unwrap_or_default(),
        )?;
        self.plan.set_network(NetworkConfig {
            hostname,
            dns: words(&dns),
            proxy: non_empty(proxy),
            interfaces: vec![interface],
        });
        Ok(())
    }

    fn ask_disks(&mut self) -> Result<(), String> {
        let devices = list_block_devices(Path::new("/sys"));
        let (device, capacity) = if devices.is_empty() {
            eprintln!("no disks detected, enter one by hand");
            let device = ask_text("target disk", "/dev/sda")?;
            let capacity = ask_size("disk capacity (e.g. 20G)", false)?
                .ok_or_else(|| "a disk capacity is required".to_owned())?;
            (device, capacity)
        } else {
            let items: Vec<String> = devices
                .iter()
                .map(|d| {
                    format!(
                        "{} {} {}",
                        d.path.display(),
                        d.size,
                        d.model.as_deref().unwrap_or_default()
                    )
                })
                .collect();
            let idx = Select::new()
                .with_prompt("target disk (will be erased)")
                .items(&items)
                .default(0)
                .interact()
                .map_err(prompt_err)?;
            let d = &devices[idx];
            (d.path.to_string_lossy().into_owned(), d.size)
        };

        let names: Vec<&str> = ROOT_FILESYSTEMS.iter().map(|f| f.as_str()).collect();
        let fs_idx = Select::new()
            .with_prompt("root filesystem")
            .items(&names)
            .default(0)
            .interact()
            .map_err(prompt_err)?;
        let swap = ask_size("swap size (e.g. 2G, empty for none)", true)?;

        let mut partitions = Vec::new();
        match self.host.firmware {
            Firmware::Efi => partitions.push(Partition {
                id: PartitionId::new("esp"),
                size: Some(ByteSize::mib(512)),
                flags: vec![PartitionFlag::Esp],
                encryption: None,
                filesystem: Some(Filesystem {
                    fs_type: FsType::Vfat,
                    mount_point: Some("/boot/efi".to_owned()),
                    label: None,
                    options: Vec::new(),
                }),
                volume_group: None,
            }),
            Firmware::Bios => partitions.push(Partition {
                id: PartitionId::new("bios"),
                size: Some(ByteSize::mib(1)),
                flags: vec![PartitionFlag::BiosBoot],
                encryption: None,
                filesystem: None,
                volume_group: None,
            }),
        }
        if let Some(size) = swap {
            partitions.push(Partition {
                id: PartitionId::new("swap"),
                size: Some(size),
                flags: Vec::new(),
                encryption: None,
                filesystem: Some(Filesystem {
                    fs_type: FsType::Swap,
                    mount_point: None,
                    label: None,
                    options: Vec::new(),
                }),
                volume_group: None,
            });
        }
        partitions.push(Partition {
            id: PartitionId::new("root"),
            size: None,
            flags: Vec::new(),
            encryption: None,
            filesystem: Some(Filesystem {
                fs_type: ROOT_FILESYSTEMS[fs_idx],
                mount_point: Some("/".to_owned()),
                label: None,
                options: Vec::new(),
            }),
            volume_group: None,
        });
        self.plan.set_disks(vec![Disk {
            device,
            capacity,
            partitions,
        }]);
        Ok(())
    }

    fn ask_mirror(&mut self) -> Result<(), String> {
        let libcs: Vec<&str> = LibcVariant::ALL.iter().map(|v| v.as_str()).collect();
        let idx = Select::new()
            .with_prompt("target C library")
            .items(&libcs)
            .default(0)
            .interact()
            .map_err(prompt_err)?;
        let libc = LibcVariant::ALL[idx];
        let current = self.plan.mirror().cloned();
        let url = ask_text(
            "primary repository",
            current.as_ref().map_or(MAIN_REPO, |m| m.url.as_str()),
        )?;
        let extra = ask_optional(
            "extra repositories (space-separated, empty for none)",
            &current
                .as_ref()
                .map_or_else(|| COMMUNITY_REPO.to_owned(), |m| m.extra_repositories.join(" ")),
        )?;
        self.plan.set_mirror(MirrorSelection {
            url,
            key_set: libc,
            extra_repositories: words(&extra),
        });
        let names = self
            .plan
            .packages()
            .map(|p| p.names.clone())
            .unwrap_or_default();
        self.plan.set_packages(PackageSelection { libc, names });
        Ok(())
    }

    fn ask_packages(&mut self) -> Result<(), String> {
        let current = self.plan.packages().cloned();
        let initial = current
            .as_ref()
            .map(|p| {
                p.names
                    .iter()
                    .map(PackageName::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let names = ask_optional("additional packages (space-separated)", &initial)?;
        let libc = self.plan.target_libc().unwrap_or(LibcVariant::Musl);
        self.plan.set_packages(PackageSelection {
            libc,
            names: names.split_whitespace().map(PackageName::new).collect(),
        });
        Ok(())
    }

    fn ask_bootloader(&mut self) -> Result<(), String> {
        let device = self
            .plan
            .disks()
            .and_then(|d| d.first())
            .map(|d| d.device.clone())
            .unwrap_or_default();
        let firmware = self.host.firmware;
        let secure_boot_shim = firmware == Firmware::Efi
            && Confirm::new()
                .with_prompt("install the Secure Boot shim?")
                .default(false)
                .interact()
                .map_err(prompt_err)?;
        let serial = ask_optional("serial console (e.g. ttyS0,115200, empty for none)", "")?;
        let args = ask_optional("extra kernel arguments (empty for none)", "")?;
        self.plan.set_bootloader(BootloaderConfig {
            device,
            firmware,
            secure_boot_shim,
            serial_console: non_empty(serial),
            kernel_args: words(&args),
        });
        Ok(())
    }

    fn ask_users(&mut self) -> Result<(), String> {
        let mut users: Vec<UserAccount> = Vec::new();
        eprintln!("the root account will be locked");
        loop {
            let more = Confirm::new()
                .with_prompt("add a user account?")
                .default(users.is_empty())
                .interact()
                .map_err(prompt_err)?;
            if !more {
                break;
            }
            let name = ask_text("user name", "")?;
            let plaintext = Password::new()
                .with_prompt("password")
                .with_confirmation("repeat password", "passwords do not match")
                .interact()
                .map_err(prompt_err)?;
            let password = hash_password(&HostRunner, &plaintext).map_err(|e| e.to_string())?;
            let gecos = ask_optional("full name (empty for none)", "")?;
            let admin = Confirm::new()
                .with_prompt("allow administration with sudo?")
                .default(users.is_empty())
                .interact()
                .map_err(prompt_err)?;
            users.push(UserAccount {
                name,
                password,
                gecos: non_empty(gecos),
                admin,
            });
        }
        self.plan.set_users(users);
        Ok(())
    }
}

fn print_summary(plan: &InstallPlan) {
    let bold = Style::new().bold();
    eprintln!("\n{}", bold.apply_to("summary"));
    for disk in plan.disks().unwrap_or_default() {
        eprintln!("  disk        {} ({})", disk.device, disk.capacity);
        for part in &disk.partitions {
            let mut fs = match (&part.filesystem, &part.volume_group) {
                (Some(f), _) => f.fs_type.to_string(),
                (None, Some(vg)) => format!("lvm:{}", vg.name),
                (None, None) => "-".to_owned(),
            };
            if let Some(enc) = &part.encryption {
                fs = format!("luks:{} {fs}", enc.name);
            }
            let size = part.size.map_or_else(|| "rest".to_owned(), |s| s.to_string());
            eprintln!(
                "    {:<8} {:<6} {:<6} {}",
                part.id.as_str(),
                size,
                fs,
                part.mount_point().unwrap_or_default()
            );
            for lv in part.volume_group.iter().flat_map(|vg| &vg.logical_volumes) {
                let size = lv.size.map_or_else(|| "rest".to_owned(), |s| s.to_string());
                eprintln!(
                    "      {:<6} {:<6} {:<6} {}",
                    lv.name,
                    size,
                    lv.filesystem.fs_type.to_string(),
                    lv.filesystem.mount_point.as_deref().unwrap_or_default()
                );
            }
        }
    }
    if let Some(libc) = plan.target_libc() {
        eprintln!("  target      {libc}");
    }
    if let Some(net) = plan.network() {
        eprintln!("  hostname    {}", net.hostname);
    }
    let users = plan.users().unwrap_or_default();
    eprintln!("  users       {}", users.len());
}

pub fn run(
    config_path: Option<&Path>,
    save_plan: Option<&Path>,
    dry_run: bool,
    json: bool,
) -> Result<u8, String> {
    if !(stdin().is_terminal() && stderr().is_terminal()) {
        return Err("interactive mode requires a terminal (use 'alpinst install <plan>')".to_owned());
    }
    let config = load_config(config_path)?;
    let target = Target::new(config, dry_run)?;

    let plan = Questionnaire::new(&target.engine).run()?;
    print_summary(&plan);

    if let Some(path) = save_plan {
        let text = dump(&plan).map_err(|e| e.to_string())?;
        write_atomic(path, &text)?;
        eprintln!("plan saved to {}", path.display());
    }

    let device = plan
        .disks()
        .and_then(|d| d.first())
        .map(|d| d.device.clone())
        .unwrap_or_default();
    let prompt = if dry_run {
        format!("simulate installation to {device}?")
    } else {
        format!("erase {device} and install?")
    };
    let proceed = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(prompt_err)?;
    if !proceed {
        eprintln!("nothing was changed");
        return Ok(EXIT_CANCELLED);
    }
    if !dry_run {
        check_prereqs(&plan)?;
    }
    execute(&target, plan, None, json)
}
