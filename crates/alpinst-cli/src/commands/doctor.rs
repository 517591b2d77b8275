use super::{load_config, EXIT_FAILURE, EXIT_SUCCESS};
use alpinst_core::{Engine, InstallLock};
use alpinst_runtime::prereq::check_optional_prereqs;
use alpinst_runtime::{check_install_prereqs, format_missing, HostFacts, InstallerConfig, KeyInventory};
use alpinst_schema::{load_file, FsType, LibcVariant};
use std::path::Path;

pub fn run(config_path: Option<&Path>, plan: Option<&Path>, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(&mut checks, &mut all_pass);

    match load_config(config_path) {
        Ok(config) => {
            checks.push(Check::pass("config", "Installer configuration loaded"));
            check_host(&config, &mut checks);
            check_keys(&config, &mut checks, &mut all_pass);
            check_package_managers(&config, &mut checks);
            check_lock(&config, &mut checks, &mut all_pass);
            if let Some(plan) = plan {
                check_plan(config, plan, &mut checks, &mut all_pass);
            }
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("config", &e));
        }
    }
    check_disk_space(&std::env::temp_dir(), &mut checks);

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let all_fs = [FsType::Ext4, FsType::Xfs, FsType::Btrfs, FsType::Vfat, FsType::Swap];
    let missing = check_install_prereqs(&all_fs);
    if missing.is_empty() {
        checks.push(Check::pass(
            "install_prereqs",
            "Installation tools available",
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "install_prereqs",
            &format!("Missing prerequisites: {}", format_missing(&missing)),
        ));
    }

    let optional = check_optional_prereqs();
    if optional.is_empty() {
        checks.push(Check::pass("optional_prereqs", "Optional tools available"));
    } else {
        let names: Vec<String> = optional.iter().map(ToString::to_string).collect();
        checks.push(Check::warn(
            "optional_prereqs",
            &format!("Optional tools missing: {}", names.join(", ")),
        ));
    }
}

fn check_host(config: &InstallerConfig, checks: &mut Vec<Check>) {
    let host = HostFacts::detect(config.arch.as_deref());
    checks.push(Check::info(
        "host",
        &format!(
            "Host: {} {} ({} firmware)",
            host.arch, host.libc, host.firmware
        ),
    ));
}

fn check_keys(config: &InstallerConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match KeyInventory::scan(&config.keys_dir) {
        Ok(inventory) => {
            for variant in LibcVariant::ALL {
                let count = inventory.keys(variant).len();
                let name = format!("keys_{variant}");
                if count == 0 {
                    checks.push(Check::warn(
                        &name,
                        &format!(
                            "No {variant} signing keys in {}",
                            config.keys_for(variant).display()
                        ),
                    ));
                } else {
                    checks.push(Check::pass(
                        &name,
                        &format!("{count} {variant} signing key(s)"),
                    ));
                }
            }
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "keys",
                &format!("Cannot read {}: {e}", config.keys_dir.display()),
            ));
        }
    }
}

fn check_package_managers(config: &InstallerConfig, checks: &mut Vec<Check>) {
    for variant in LibcVariant::ALL {
        let path = config.package_manager.for_variant(variant);
        let name = format!("apk_{variant}");
        if path.is_file() {
            checks.push(Check::pass(
                &name,
                &format!("{variant} package manager at {}", path.display()),
            ));
        } else {
            checks.push(Check::warn(
                &name,
                &format!("No {variant} package manager at {}", path.display()),
            ));
        }
    }
}

fn check_lock(config: &InstallerConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match InstallLock::try_acquire(&config.lock_file) {
        Ok(Some(_)) => checks.push(Check::pass("install_lock", "No installer is running")),
        Ok(None) => checks.push(Check::warn(
            "install_lock",
            "Another installer holds the install lock",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "install_lock",
                &format!("Cannot check install lock: {e}"),
            ));
        }
    }
}

fn check_plan(config: InstallerConfig, plan: &Path, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let plan = match load_file(plan) {
        Ok(p) => p,
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("plan", &e.to_string()));
            return;
        }
    };
    match Engine::new(config).validate(&plan) {
        Ok(_) => checks.push(Check::pass("plan", "Plan validates on this machine")),
        Err(errors) => {
            *all_pass = false;
            checks.push(Check::fail(
                "plan",
                &format!("Plan has {} validation error(s): {}", errors.len(), errors[0]),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("alpinst doctor\n");
        for check in checks {
            let icon = match check.status.as_str() {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: String,
    status: String,
    message: String,
}

impl Check {
    fn new(name: &str, status: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: status.to_owned(),
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

/// Index downloads and dry runs use the temp directory.
fn check_disk_space(path: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(path.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: statvfs with a valid, NUL-terminated path and a properly
    // zeroed output struct is well-defined. The struct is only read after
    // the call succeeds (ret == 0).
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::unnecessary_cast)]
    let avail_mb = (stat.f_bavail as u64 * stat.f_frsize as u64) / (1024 * 1024);

    if avail_mb < 16 {
        checks.push(Check::fail(
            "temp_space",
            &format!("Low temporary space: {avail_mb} MB available in {}", path.display()),
        ));
    } else if avail_mb < 128 {
        checks.push(Check::warn(
            "temp_space",
            &format!("Temporary space: {avail_mb} MB available in {}", path.display()),
        ));
    } else {
        checks.push(Check::pass(
            "temp_space",
            &format!("Temporary space: {avail_mb} MB available"),
        ));
    }
}
