use alpinst_schema::FsType;
use std::fmt;
use std::path::Path;

/// A host tool the installer needs but cannot find.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

const SEARCH_PATH: &[&str] = &["/usr/local/sbin", "/usr/local/bin", "/usr/sbin", "/usr/bin", "/sbin", "/bin"];

fn command_exists(name: &str) -> bool {
    let from_env = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();
    from_env
        .iter()
        .map(AsRef::as_ref)
        .chain(SEARCH_PATH.iter().map(Path::new))
        .any(|dir| dir.join(name).is_file())
}

const BASE_TOOLS: &[(&str, &str, &str)] = &[
    ("sfdisk", "writing partition tables", "apk add sfdisk"),
    ("partx", "re-reading partition tables", "apk add partx"),
    ("wipefs", "clearing old signatures", "apk add wipefs"),
    ("blockdev", "reading device sizes", "apk add util-linux-misc"),
    ("blkid", "reading filesystem UUIDs", "apk add blkid"),
    ("mount", "mounting target filesystems", "apk add util-linux-misc"),
    ("umount", "unmounting target filesystems", "apk add util-linux-misc"),
    ("chroot", "running tools inside the target", "apk add coreutils"),
    ("openssl", "verifying repository index signatures", "apk add openssl"),
];

const ENCRYPTION_TOOLS: &[(&str, &str, &str)] = &[(
    "cryptsetup",
    "creating LUKS containers",
    "apk add cryptsetup",
)];

const LVM_TOOLS: &[(&str, &str, &str)] = &[
    ("pvcreate", "creating LVM physical volumes", "apk add lvm2"),
    ("vgcreate", "creating LVM volume groups", "apk add lvm2"),
    ("lvcreate", "creating LVM logical volumes", "apk add lvm2"),
    ("vgchange", "deactivating LVM volume groups", "apk add lvm2"),
];

fn missing_from(tools: &[(&'static str, &'static str, &'static str)]) -> Vec<MissingPrereq> {
    tools
        .iter()
        .filter(|(name, _, _)| !command_exists(name))
        .map(|&(name, purpose, install_hint)| MissingPrereq {
            name,
            purpose,
            install_hint,
        })
        .collect()
}

fn mkfs_tool(fs: FsType) -> (&'static str, &'static str) {
    match fs {
        FsType::Ext4 => ("mkfs.ext4", "apk add e2fsprogs"),
        FsType::Xfs => ("mkfs.xfs", "apk add xfsprogs"),
        FsType::Btrfs => ("mkfs.btrfs", "apk add btrfs-progs"),
        FsType::Vfat => ("mkfs.vfat", "apk add dosfstools"),
        FsType::Swap => ("mkswap", "apk add util-linux-misc"),
    }
}

/// Host tools needed to install a plan using the given filesystem types.
/// Empty means everything is present.
pub fn check_install_prereqs(filesystems: &[FsType]) -> Vec<MissingPrereq> {
    let mut missing = missing_from(BASE_TOOLS);

    let mut seen = Vec::new();
    for &fs in filesystems {
        let (name, install_hint) = mkfs_tool(fs);
        if seen.contains(&name) {
            continue;
        }
        seen.push(name);
        if !command_exists(name) {
            missing.push(MissingPrereq {
                name,
                purpose: "creating filesystems",
                install_hint,
            });
        }
    }
    missing
}

/// Host tools for the storage layers a plan uses.
pub fn check_layer_prereqs(encryption: bool, lvm: bool) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if encryption {
        missing.extend(missing_from(ENCRYPTION_TOOLS));
    }
    if lvm {
        missing.extend(missing_from(LVM_TOOLS));
    }
    missing
}

/// Tools that only some plans need.
pub fn check_optional_prereqs() -> Vec<MissingPrereq> {
    check_layer_prereqs(true, true)
}

pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nalpinst needs these tools on the installation host.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "sfdisk",
            purpose: "writing partition tables",
            install_hint: "apk add sfdisk",
        };
        let s = format!("{m}");
        assert!(s.contains("sfdisk"));
        assert!(s.contains("writing partition tables"));
        assert!(s.contains("apk add sfdisk"));
    }

    #[test]
    fn format_missing_produces_readable_output() {
        let items = vec![
            MissingPrereq {
                name: "sfdisk",
                purpose: "partitions",
                install_hint: "apk add sfdisk",
            },
            MissingPrereq {
                name: "mkfs.xfs",
                purpose: "filesystems",
                install_hint: "apk add xfsprogs",
            },
        ];
        let output = format_missing(&items);
        assert!(output.contains("missing prerequisites:"));
        assert!(output.contains("sfdisk"));
        assert!(output.contains("mkfs.xfs"));
    }

    #[test]
    fn mkfs_tools_checked_once_per_type() {
        let missing = check_install_prereqs(&[FsType::Ext4, FsType::Ext4]);
        assert!(missing.iter().filter(|m| m.name == "mkfs.ext4").count() <= 1);
    }

    #[test]
    fn layer_tools_only_when_used() {
        assert!(check_layer_prereqs(false, false).is_empty());
        let all = check_layer_prereqs(true, true);
        assert!(all.iter().all(|m| {
            ENCRYPTION_TOOLS.iter().chain(LVM_TOOLS).any(|(name, _, _)| *name == m.name)
        }));
        assert!(!BASE_TOOLS.iter().any(|(name, _, _)| *name == "tar"));
    }

    #[test]
    fn shell_is_found() {
        assert!(command_exists("sh"));
        assert!(!command_exists("alpinst-no-such-tool"));
    }
}
