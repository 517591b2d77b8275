//! Configuration files written into the target: console keymap, locale,
//! timezone, host name, network interfaces, resolver, proxy and OpenRC
//! runlevel links.

use crate::staging::StagingRoot;
use crate::RuntimeError;
use alpinst_schema::{AddressMethod, KeyboardLayout, NetworkConfig};
use std::fmt::Write as _;
use tracing::debug;

pub const LOADKMAP_CONF: &str = "/etc/conf.d/loadkmap";
pub const LOCALE_PROFILE: &str = "/etc/profile.d/locale.sh";
pub const PROXY_PROFILE: &str = "/etc/profile.d/proxy.sh";
pub const INTERFACES: &str = "/etc/network/interfaces";
const BKEYMAPS: &str = "/usr/share/bkeymaps";

/// Console layouts shipped by `kbd-bkeymaps`.
pub const KEYMAPS: &[&str] = &[
    "af", "al", "am", "ara", "at", "az", "ba", "bd", "be", "bg", "br", "by", "ca", "ch", "cm",
    "cn", "cz", "de", "dk", "dz", "ee", "epo", "es", "fi", "fo", "fr", "gb", "ge", "gh", "gr",
    "hr", "hu", "ie", "il", "in", "iq", "ir", "is", "it", "jp", "ke", "kg", "kr", "kz", "la",
    "latam", "lk", "lt", "lv", "ma", "md", "me", "mk", "ml", "mm", "mn", "mt", "mv", "ng", "nl",
    "no", "np", "ph", "pk", "pl", "pt", "ro", "rs", "ru", "se", "si", "sk", "sn", "sy", "th",
    "tj", "tm", "tr", "tw", "tz", "ua", "us", "uz", "vn",
];

pub fn is_known_keymap(layout: &str) -> bool {
    KEYMAPS.contains(&layout)
}

fn keymap_file(kb: &KeyboardLayout) -> String {
    let variant = kb.layout_variant.as_deref().unwrap_or(&kb.layout);
    format!("{BKEYMAPS}/{}/{variant}.bmap.gz", kb.layout)
}

pub fn render_loadkmap(kb: &KeyboardLayout) -> String {
    format!("KEYMAP=\"{}\"\n", keymap_file(kb))
}

pub fn render_locale(kb: &KeyboardLayout) -> String {
    format!("export LANG={}\nexport LC_COLLATE=C\n", kb.locale)
}

pub fn write_keyboard(staging: &StagingRoot, kb: &KeyboardLayout) -> Result<(), RuntimeError> {
    staging.write_file(LOADKMAP_CONF, &render_loadkmap(kb), 0o644)?;
    staging.write_file(LOCALE_PROFILE, &render_locale(kb), 0o644)?;
    let tz = kb.timezone.as_deref().unwrap_or("UTC");
    staging.write_file("/etc/timezone", &format!("{tz}\n"), 0o644)?;
    staging.symlink("/etc/localtime", &format!("/usr/share/zoneinfo/{tz}"))?;
    enable_service(staging, "loadkmap", "boot")
}

pub fn render_hosts(hostname: &str) -> String {
    let short = hostname.split('.').next().unwrap_or(hostname);
    let names = if short == hostname {
        hostname.to_owned()
    } else {
        format!("{hostname} {short}")
    };
    format!(
        "127.0.0.1\t{names} localhost localhost.localdomain\n::1\t\t{names} localhost localhost.localdomain\n"
    )
}

/// ifupdown-ng syntax, loopback first.
pub fn render_interfaces(network: &NetworkConfig) -> String {
    let mut out = String::from("auto lo\niface lo inet loopback\n");
    for iface in &network.interfaces {
        let _ = write!(out, "\nauto {}\n", iface.name);
        match iface.method {
            AddressMethod::Dhcp => {
                let _ = writeln!(out, "iface {} inet dhcp", iface.name);
            }
            AddressMethod::Static => {
                let _ = writeln!(out, "iface {} inet static", iface.name);
                if let Some(addr) = &iface.address {
                    match iface.prefix {
                        Some(p) => {
                            let _ = writeln!(out, "\taddress {addr}/{p}");
                        }
                        None => {
                            let _ = writeln!(out, "\taddress {addr}");
                        }
                    }
                }
                if let Some(gw) = &iface.gateway {
                    let _ = writeln!(out, "\tgateway {gw}");
                }
            }
        }
    }
    out
}

pub fn render_resolv(dns: &[String]) -> String {
    dns.iter().map(|s| format!("nameserver {s}\n")).collect()
}

pub fn render_proxy(proxy: &str) -> String {
    format!("export http_proxy=\"{proxy}\"\nexport https_proxy=\"{proxy}\"\n")
}

pub fn write_network(staging: &StagingRoot, network: &NetworkConfig) -> Result<(), RuntimeError> {
    staging.write_file("/etc/hostname", &format!("{}\n", network.hostname), 0o644)?;
    staging.write_file("/etc/hosts", &render_hosts(&network.hostname), 0o644)?;
    staging.write_file(INTERFACES, &render_interfaces(network), 0o644)?;
    if !network.dns.is_empty() {
        staging.write_file("/etc/resolv.conf", &render_resolv(&network.dns), 0o644)?;
    }
    if let Some(proxy) = &network.proxy {
        staging.write_file(PROXY_PROFILE, &render_proxy(proxy), 0o644)?;
    }
    enable_service(staging, "networking", "boot")
}

/// `rc-update add` equivalent: link the init script into a runlevel.
pub fn enable_service(
    staging: &StagingRoot,
    service: &str,
    runlevel: &str,
) -> Result<(), RuntimeError> {
    debug!("enabling {service} in runlevel {runlevel}");
    staging.symlink(
        &format!("/etc/runlevels/{runlevel}/{service}"),
        &format!("/etc/init.d/{service}"),
    )
}
