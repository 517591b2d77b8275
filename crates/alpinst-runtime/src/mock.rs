//! Stand-ins for the host, used by tests and by dry runs.
//!
//! `RecordingRunner` executes nothing. It records every invocation, answers
//! the few query tools whose output the installer parses, and reproduces the
//! filesystem effects later steps rely on (`apk` creating a base system,
//! `adduser` adding a shadow entry) inside the staging root.

use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::host::HostFacts;
use crate::keys::KeyInventory;
use crate::mirror::MirrorStatus;
use crate::environment::{Environment, MirrorQuery};
use crate::RuntimeError;
use alpinst_schema::{Firmware, LibcVariant};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_DEVICE_SIZE: u64 = 1 << 40;
const BASE_SHADOW: &str = "root:*:0:0:::::\n";
const BASE_PASSWD: &str = "root:x:0:0:root:/root:/bin/ash\n";

enum Scripted {
    Fail(String),
    Hang,
}

pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    scripted: Mutex<BTreeMap<String, Scripted>>,
    device_size: u64,
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(BTreeMap::new()),
            device_size: DEFAULT_DEVICE_SIZE,
        }
    }
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size reported by `blockdev --getsize64` for every device.
    #[must_use]
    pub fn with_device_size(mut self, bytes: u64) -> Self {
        self.device_size = bytes;
        self
    }

    /// Make every call to `program` exit with status 1 and `stderr`.
    pub fn fail_on(&self, program: &str, stderr: &str) {
        if let Ok(mut s) = self.scripted.lock() {
            s.insert(program.to_owned(), Scripted::Fail(stderr.to_owned()));
        }
    }

    /// Make every call to `program` run out of time.
    pub fn hang_on(&self, program: &str) {
        if let Ok(mut s) = self.scripted.lock() {
            s.insert(program.to_owned(), Scripted::Hang);
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Programs called, looking through `chroot`.
    pub fn programs(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(|i| i.effective_program().to_owned())
            .collect()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.effective_program() == program)
            .collect()
    }

    fn answer(&self, inv: &Invocation) -> Result<String, RuntimeError> {
        let args = &inv.args;
        match inv.effective_program() {
            "blockdev" => Ok(format!("{}\n", self.device_size)),
            "blkid" => Ok(format!("{}\n", fake_uuid(args.last().map_or("", String::as_str)))),
            "adduser" => {
                if let (Some(root), Some(name)) = (args.first(), args.last()) {
                    append(
                        &Path::new(root).join("etc/shadow"),
                        &format!("{name}:!:0:0:99999:7:::\n"),
                    )?;
                }
                Ok(String::new())
            }
            program if program.ends_with("apk.static") || program == "apk" => {
                if let Some(root) = flag_value(args, "--root") {
                    seed_base_system(Path::new(root))?;
                }
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Stable UUID-shaped value derived from a device path.
fn fake_uuid(device: &str) -> String {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in device.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    let hex = format!("{h:016x}{:016x}", h.rotate_left(29));
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn append(path: &Path, line: &str) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    Ok(())
}

fn seed_base_system(root: &Path) -> Result<(), RuntimeError> {
    let etc = root.join("etc");
    fs::create_dir_all(&etc)?;
    for (name, content) in [("shadow", BASE_SHADOW), ("passwd", BASE_PASSWD)] {
        let path = etc.join(name);
        if !path.exists() {
            fs::write(path, content)?;
        }
    }
    Ok(())
}

impl CommandRunner for RecordingRunner {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput, RuntimeError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        let program = invocation.effective_program();
        if let Ok(scripted) = self.scripted.lock() {
            match scripted.get(program) {
                Some(Scripted::Fail(stderr)) => {
                    return Err(RuntimeError::CommandFailed {
                        program: program.to_owned(),
                        status: "status 1".to_owned(),
                        stderr: stderr.clone(),
                    });
                }
                Some(Scripted::Hang) => {
                    return Err(RuntimeError::Timeout {
                        program: program.to_owned(),
                        secs: timeout.as_secs(),
                    });
                }
                None => {}
            }
        }
        Ok(CommandOutput {
            stdout: self.answer(invocation)?,
            stderr: String::new(),
        })
    }

    fn wait_for_path(&self, _path: &Path, _timeout: Duration) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Fixed answers for every environment question.
#[derive(Debug, Clone)]
pub struct StaticEnvironment {
    pub host: HostFacts,
    pub keys: KeyInventory,
    pub mirrors: BTreeMap<String, MirrorStatus>,
}

impl StaticEnvironment {
    /// An x86_64 EFI host of the given variant with no keys and no mirrors.
    pub fn new(host_libc: LibcVariant) -> Self {
        Self {
            host: HostFacts {
                libc: host_libc,
                arch: "x86_64".to_owned(),
                firmware: Firmware::Efi,
            },
            keys: KeyInventory::new(),
            mirrors: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_keys(mut self, variant: LibcVariant, names: &[&str]) -> Self {
        self.keys
            .insert(variant, names.iter().map(|n| (*n).to_owned()).collect());
        self
    }

    #[must_use]
    pub fn with_mirror(mut self, url: &str, status: MirrorStatus) -> Self {
        self.mirrors.insert(url.to_owned(), status);
        self
    }
}

impl Environment for StaticEnvironment {
    fn host(&self) -> HostFacts {
        self.host.clone()
    }

    fn keys(&self) -> Result<KeyInventory, RuntimeError> {
        Ok(self.keys.clone())
    }

    fn mirror(&self, url: &str, _query: MirrorQuery<'_>) -> MirrorStatus {
        self.mirrors
            .get(url)
            .cloned()
            .unwrap_or_else(|| MirrorStatus::Unreachable {
                reason: format!("no route to {url}"),
            })
    }
}

/// Staging root for a dry run: a fresh directory beside nothing real.
pub fn dry_run_root() -> Result<(tempfile::TempDir, PathBuf), RuntimeError> {
    let dir = tempfile::Builder::new().prefix("alpinst-dry-run-").tempdir()?;
    let root = dir.path().join("target");
    Ok((dir, root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MirrorIndex;

    #[test]
    fn records_calls_and_answers_queries() {
        let runner = RecordingRunner::new().with_device_size(4096);
        let out = runner
            .run(
                &Invocation::new("blockdev").args(["--getsize64", "/dev/sda"]),
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(out.stdout.trim(), "4096");

        let a = runner
            .run(&Invocation::new("blkid").arg("/dev/sda1"), Duration::from_secs(1))
            .unwrap();
        let b = runner
            .run(&Invocation::new("blkid").arg("/dev/sda1"), Duration::from_secs(1))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.stdout.trim().len(), 36);
        assert_eq!(runner.programs(), ["blockdev", "blkid", "blkid"]);
    }

    #[test]
    fn scripted_failure_and_hang() {
        let runner = RecordingRunner::new();
        runner.fail_on("sfdisk", "device busy");
        runner.hang_on("grub-install");
        let err = runner
            .run(&Invocation::new("sfdisk"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { stderr, .. } if stderr == "device busy"));
        let err = runner
            .run(
                &Invocation::chroot(Path::new("/t"), "grub-install"),
                Duration::from_secs(7),
            )
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { secs: 7, .. }));
    }

    #[test]
    fn apk_and_adduser_leave_traces_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let runner = RecordingRunner::new();
        runner
            .run(
                &Invocation::new("/usr/lib/alpinst/musl/apk.static").args(["--root", root.as_str(), "add", "alpine-base"]),
                Duration::from_secs(1),
            )
            .unwrap();
        runner
            .run(
                &Invocation::chroot(dir.path(), "adduser").args(["-D", "alice"]),
                Duration::from_secs(1),
            )
            .unwrap();
        let shadow = fs::read_to_string(dir.path().join("etc/shadow")).unwrap();
        assert!(shadow.starts_with("root:*:"));
        assert!(shadow.contains("alice:!:"));
    }

    #[test]
    fn static_environment_defaults_to_unreachable() {
        let environment = StaticEnvironment::new(LibcVariant::Glibc)
            .with_keys(LibcVariant::Musl, &["a.rsa.pub"])
            .with_mirror(
                "https://m/main",
                MirrorStatus::Reachable {
                    index: MirrorIndex::default(),
                },
            );
        assert!(environment.mirror("https://m/main", MirrorQuery::new("x86_64")).index().is_some());
        assert!(environment.mirror("https://other", MirrorQuery::new("x86_64")).index().is_none());
        assert!(environment.keys().unwrap().has_key(LibcVariant::Musl, "a.rsa.pub"));
    }
}
