//! `apk` invocation against the staging root.
//!
//! The binary is picked from the target's C library, never the host's: a
//! glibc host installing a musl target runs the musl `apk.static`, and the
//! trust store passed to it is the one populated from the target variant's
//! key set.

use crate::command::{Invocation, Session};
use crate::config::InstallerConfig;
use crate::keys;
use crate::staging::StagingRoot;
use crate::RuntimeError;
use alpinst_schema::{LibcVariant, MirrorSelection};
use std::path::Path;
use tracing::info;

pub const REPOSITORIES_FILE: &str = "/etc/apk/repositories";

pub fn binary_for(config: &InstallerConfig, target: LibcVariant) -> &Path {
    config.package_manager.for_variant(target)
}

pub fn render_repositories(mirror: &MirrorSelection) -> String {
    let mut out = String::new();
    for repo in mirror.repositories() {
        out.push_str(repo.trim_end_matches('/'));
        out.push('\n');
    }
    out
}

pub fn write_repositories(
    staging: &StagingRoot,
    mirror: &MirrorSelection,
) -> Result<(), RuntimeError> {
    staging.write_file(REPOSITORIES_FILE, &render_repositories(mirror), 0o644)
}

/// Variables `apk` reads to reach repositories through a proxy.
pub const PROXY_VARS: &[&str] = &["http_proxy", "https_proxy"];

/// `apk add` into the staging root with the target's trust store and
/// repositories file, fetching through `proxy` when one is planned.
pub fn add_invocation(
    config: &InstallerConfig,
    target: LibcVariant,
    staging: &StagingRoot,
    packages: &[String],
    proxy: Option<&str>,
) -> Result<Invocation, RuntimeError> {
    let root = staging.path().to_string_lossy().into_owned();
    let keys_dir = keys::trust_store(staging)?;
    let repos = staging.resolve(REPOSITORIES_FILE)?;
    let mut inv = Invocation::new(binary_for(config, target).to_string_lossy());
    if let Some(proxy) = proxy {
        for var in PROXY_VARS {
            inv = inv.env(*var, proxy);
        }
    }
    Ok(inv
        .args(["--root", root.as_str(), "--initdb"])
        .arg("--keys-dir")
        .arg(keys_dir.to_string_lossy())
        .arg("--repositories-file")
        .arg(repos.to_string_lossy())
        .args(["--update-cache", "--no-progress", "--clean-protected", "add"])
        .args(packages.iter().cloned()))
}

pub fn install(
    session: &Session<'_>,
    config: &InstallerConfig,
    target: LibcVariant,
    staging: &StagingRoot,
    packages: &[String],
    proxy: Option<&str>,
) -> Result<(), RuntimeError> {
    info!(
        "installing {} packages for a {target} target",
        packages.len()
    );
    session.run(&add_invocation(config, target, staging, packages, proxy)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InstallerConfig {
        InstallerConfig::default()
    }

    #[test]
    fn binary_follows_target_variant() {
        let c = config();
        assert_eq!(
            binary_for(&c, LibcVariant::Musl),
            Path::new("/usr/lib/alpinst/musl/apk.static")
        );
        assert_eq!(
            binary_for(&c, LibcVariant::Glibc),
            Path::new("/usr/lib/alpinst/glibc/apk.static")
        );
    }

    #[test]
    fn add_uses_staging_trust_store() {
        let staging = StagingRoot::new("/mnt/target_root");
        let inv = add_invocation(
            &config(),
            LibcVariant::Musl,
            &staging,
            &["alpine-base".to_owned(), "openssh".to_owned()],
            None,
        )
        .unwrap();
        assert_eq!(inv.program, "/usr/lib/alpinst/musl/apk.static");
        let line = inv.display();
        assert!(line.contains("--root /mnt/target_root --initdb"));
        assert!(line.contains("--keys-dir /mnt/target_root/etc/apk/keys"));
        assert!(line.contains("--repositories-file /mnt/target_root/etc/apk/repositories"));
        assert!(line.ends_with("add alpine-base openssh"));
        assert!(inv.env.is_empty());
    }

    #[test]
    fn add_fetches_through_planned_proxy() {
        let staging = StagingRoot::new("/mnt/target_root");
        let inv = add_invocation(
            &config(),
            LibcVariant::Glibc,
            &staging,
            &["alpine-base".to_owned()],
            Some("http://proxy.lan:3128"),
        )
        .unwrap();
        assert_eq!(
            inv.env,
            [
                ("http_proxy".to_owned(), "http://proxy.lan:3128".to_owned()),
                ("https_proxy".to_owned(), "http://proxy.lan:3128".to_owned()),
            ]
        );
    }

    #[test]
    fn repositories_file_lists_mirror_first() {
        let mirror = MirrorSelection {
            url: "https://m/v3.20/main/".to_owned(),
            key_set: LibcVariant::Musl,
            extra_repositories: vec!["/media/cdrom/apks".to_owned()],
        };
        assert_eq!(
            render_repositories(&mirror),
            "https://m/v3.20/main\n/media/cdrom/apks\n"
        );
    }
}
