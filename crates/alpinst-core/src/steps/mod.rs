//! The seven step controllers and the package set they imply together.

pub mod bootloader;
pub mod disk;
pub mod keyboard;
pub mod mirror;
pub mod network;
pub mod packages;
pub mod users;

use crate::step::StepController;
use alpinst_schema::InstallPlan;

pub use bootloader::BootloaderStep;
pub use disk::DiskStep;
pub use keyboard::KeyboardStep;
pub use mirror::MirrorStep;
pub use network::NetworkStep;
pub use packages::PackagesStep;
pub use users::UsersStep;

/// One controller per step, in apply order.
pub fn default_steps() -> Vec<Box<dyn StepController>> {
    vec![
        Box::new(KeyboardStep),
        Box::new(NetworkStep),
        Box::new(DiskStep::default()),
        Box::new(MirrorStep),
        Box::new(PackagesStep),
        Box::new(BootloaderStep),
        Box::new(UsersStep),
    ]
}

/// Packages other steps need inside the target, in step order.
pub fn implied_packages(plan: &InstallPlan) -> Vec<&'static str> {
    let mut out = Vec::new();
    for pkg in keyboard::implied(plan)
        .into_iter()
        .chain(network::implied(plan))
        .chain(disk::implied(plan))
        .chain(bootloader::implied(plan))
        .chain(users::implied(plan))
    {
        if !out.contains(&pkg) {
            out.push(pkg);
        }
    }
    out
}

/// Everything `apk add` installs: base, then implied, then requested
/// packages, first occurrence wins.
pub fn package_list(plan: &InstallPlan, base: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let requested = plan
        .packages()
        .map(|p| p.names.iter().map(|n| n.as_str().to_owned()).collect::<Vec<_>>())
        .unwrap_or_default();
    for name in base
        .iter()
        .cloned()
        .chain(implied_packages(plan).into_iter().map(str::to_owned))
        .chain(requested)
    {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::context::PlanContext;
    use alpinst_runtime::{MirrorIndex, MirrorStatus, SignatureCheck, StaticEnvironment};
    use alpinst_schema::{get_template, load, InstallPlan, LibcVariant};

    pub const MAIN: &str = "https://dl-cdn.alpinelinux.org/alpine/latest-stable/main";
    pub const COMMUNITY: &str = "https://dl-cdn.alpinelinux.org/alpine/latest-stable/community";
    pub const MUSL_KEY: &str = "alpine-devel@lists.alpinelinux.org-6165ee59.rsa.pub";

    pub fn efi_plan() -> InstallPlan {
        load(get_template("efi-ext4").unwrap().plan).unwrap()
    }

    pub fn index(names: &[&str], signer: Option<&str>) -> MirrorStatus {
        MirrorStatus::Reachable {
            index: MirrorIndex {
                packages: names.iter().map(|n| (*n).to_owned()).collect(),
                signer: signer.map(str::to_owned),
                signature: if signer.is_some() {
                    SignatureCheck::Verified
                } else {
                    SignatureCheck::Unchecked
                },
            },
        }
    }

    pub const ALL_PACKAGES: &[&str] = &[
        "alpine-base",
        "linux-lts",
        "kbd-bkeymaps",
        "ifupdown-ng",
        "e2fsprogs",
        "dosfstools",
        "xfsprogs",
        "btrfs-progs",
        "grub",
        "grub-efi",
        "grub-bios",
        "efibootmgr",
        "sudo",
        "openssh",
        "chrony",
    ];

    /// Musl keys present, both template repositories reachable and signed.
    pub fn environment() -> StaticEnvironment {
        StaticEnvironment::new(LibcVariant::Glibc)
            .with_keys(LibcVariant::Musl, &[MUSL_KEY])
            .with_mirror(MAIN, index(ALL_PACKAGES, Some(MUSL_KEY)))
            .with_mirror(COMMUNITY, index(&[], Some(MUSL_KEY)))
    }

    pub fn context(plan: &InstallPlan) -> PlanContext {
        PlanContext::gather(
            plan,
            &environment(),
            &["alpine-base".to_owned(), "linux-lts".to_owned()],
        )
    }
}
