use serde::Serialize;

/// A plan file skeleton offered by `alpinst new`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlanTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub plan: &'static str,
}

pub const BUILTIN_TEMPLATES: &[PlanTemplate] = &[
    PlanTemplate {
        name: "efi-ext4",
        description: "UEFI machine, single disk, ext4 root, musl target",
        plan: r#"version = 1

[keyboard]
layout = "us"
locale = "en_US.UTF-8"
timezone = "UTC"

[network]
hostname = "alpine"
dns = ["1.1.1.1", "9.9.9.9"]

[[network.interfaces]]
name = "eth0"
method = "dhcp"

[mirror]
url = "https://dl-cdn.alpinelinux.org/alpine/latest-stable/main"
key_set = "musl"
extra_repositories = ["https://dl-cdn.alpinelinux.org/alpine/latest-stable/community"]

[packages]
libc = "musl"
names = ["openssh", "chrony"]

[bootloader]
device = "/dev/sda"
firmware = "efi"

[[disks]]
device = "/dev/sda"
capacity = "20G"

[[disks.partitions]]
id = "esp"
size = "512M"
flags = ["esp"]
filesystem = { type = "vfat", mount_point = "/boot/efi" }

[[disks.partitions]]
id = "root"
filesystem = { type = "ext4", mount_point = "/" }
"#,
    },
    PlanTemplate {
        name: "bios-ext4",
        description: "Legacy BIOS machine with GPT, swap and ext4 root, musl target",
        plan: r#"version = 1

[keyboard]
layout = "us"
locale = "en_US.UTF-8"

[network]
hostname = "alpine"

[[network.interfaces]]
name = "eth0"
method = "dhcp"

[mirror]
url = "https://dl-cdn.alpinelinux.org/alpine/latest-stable/main"
key_set = "musl"

[packages]
libc = "musl"
names = ["openssh"]

[bootloader]
device = "/dev/sda"
firmware = "bios"

[[disks]]
device = "/dev/sda"
capacity = "20G"

[[disks.partitions]]
id = "bios"
size = "1M"
flags = ["bios_boot"]

[[disks.partitions]]
id = "swap"
size = "2G"
filesystem = { type = "swap" }

[[disks.partitions]]
id = "root"
filesystem = { type = "ext4", mount_point = "/" }
"#,
    },
    PlanTemplate {
        name: "efi-glibc-xfs",
        description: "UEFI machine with a glibc target, xfs root and a separate /home",
        plan: r#"version = 1

[keyboard]
layout = "de"
locale = "de_DE.UTF-8"
timezone = "Europe/Berlin"

[network]
hostname = "workstation"

[[network.interfaces]]
name = "eth0"
method = "dhcp"

[mirror]
url = "https://mirror.example.org/alpine-glibc/latest-stable/main"
key_set = "glibc"

[packages]
libc = "glibc"
names = ["openssh"]

[bootloader]
device = "/dev/nvme0n1"
firmware = "efi"

[[disks]]
device = "/dev/nvme0n1"
capacity = "64G"

[[disks.partitions]]
id = "esp"
size = "512M"
flags = ["esp"]
filesystem = { type = "vfat", mount_point = "/boot/efi" }

[[disks.partitions]]
id = "root"
size = "24G"
filesystem = { type = "xfs", mount_point = "/" }

[[disks.partitions]]
id = "home"
filesystem = { type = "xfs", mount_point = "/home" }
"#,
    },
];

pub fn get_template(name: &str) -> Option<&'static PlanTemplate> {
    BUILTIN_TEMPLATES.iter().find(|t| t.name == name)
}

pub fn list_templates() -> Vec<(&'static str, &'static str)> {
    BUILTIN_TEMPLATES
        .iter()
        .map(|t| (t.name, t.description))
        .collect()
}
