use alpinst_core::{
    CoreError, Engine, ErrorKind, RunError, RunState, Sequencer, StepKind, StepStatus,
    ValidationError,
};
use alpinst_runtime::{
    CommandRunner, InstallerConfig, MirrorIndex, MirrorStatus, RecordingRunner, RuntimeError,
    SignatureCheck, StaticEnvironment,
};
use alpinst_schema::{
    dump, get_template, load, ByteSize, InstallPlan, LibcVariant, MirrorSelection, Section,
    UserAccount,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const MAIN: &str = "https://dl-cdn.alpinelinux.org/alpine/latest-stable/main";
const COMMUNITY: &str = "https://dl-cdn.alpinelinux.org/alpine/latest-stable/community";
const MUSL_KEY: &str = "alpine-devel@lists.alpinelinux.org-6165ee59.rsa.pub";
const PEM: &str = "-----BEGIN PUBLIC KEY-----\nMIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8A\n-----END PUBLIC KEY-----\n";

const PACKAGES: &[&str] = &[
    "alpine-base",
    "linux-lts",
    "kbd-bkeymaps",
    "ifupdown-ng",
    "e2fsprogs",
    "dosfstools",
    "grub",
    "grub-efi",
    "efibootmgr",
    "sudo",
    "openssh",
    "chrony",
];

const LAYER_PACKAGES: &[&str] = &["cryptsetup", "cryptsetup-openrc", "lvm2"];

fn signed(names: &[&str]) -> MirrorStatus {
    MirrorStatus::Reachable {
        index: MirrorIndex {
            packages: names.iter().map(|n| (*n).to_owned()).collect(),
            signer: Some(MUSL_KEY.to_owned()),
            signature: SignatureCheck::Verified,
        },
    }
}

/// A glibc live medium carrying the musl key set, with both repositories
/// of the template reachable.
fn glibc_host() -> StaticEnvironment {
    StaticEnvironment::new(LibcVariant::Glibc)
        .with_keys(LibcVariant::Musl, &[MUSL_KEY])
        .with_mirror(MAIN, signed(PACKAGES))
        .with_mirror(COMMUNITY, signed(&[]))
}

/// Same host, with the main repository also carrying the LUKS and LVM tools.
fn layered_host() -> StaticEnvironment {
    let names: Vec<&str> = PACKAGES.iter().chain(LAYER_PACKAGES).copied().collect();
    glibc_host().with_mirror(MAIN, signed(&names))
}

struct Harness {
    dir: TempDir,
    runner: Arc<RecordingRunner>,
    engine: Engine,
}

impl Harness {
    fn new(environment: StaticEnvironment) -> Self {
        Self::with_runner(environment, RecordingRunner::new())
    }

    fn with_runner(environment: StaticEnvironment, runner: RecordingRunner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join("keys/musl");
        fs::create_dir_all(&keys).unwrap();
        fs::write(keys.join(MUSL_KEY), PEM).unwrap();

        let config = InstallerConfig {
            staging_root: dir.path().join("target"),
            keys_dir: dir.path().join("keys"),
            lock_file: dir.path().join("alpinst.lock"),
            ..InstallerConfig::default()
        };
        let runner = Arc::new(runner);
        let engine = Engine::with_parts(
            config,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            Arc::new(environment),
        );
        Self {
            dir,
            runner,
            engine,
        }
    }

    fn target(&self, path: &str) -> PathBuf {
        self.dir.path().join("target").join(path)
    }

    fn umount_targets(&self) -> Vec<String> {
        self.runner
            .calls_to("umount")
            .into_iter()
            .filter_map(|i| i.args.last().cloned())
            .collect()
    }
}

fn musl_plan() -> InstallPlan {
    let mut plan = load(get_template("efi-ext4").unwrap().plan).unwrap();
    plan.set_users(vec![UserAccount {
        name: "alice".to_owned(),
        password: "$6$rounds=5000$salt$hash".to_owned(),
        gecos: Some("Alice".to_owned()),
        admin: true,
    }]);
    plan
}

/// The efi-ext4 template with root and home as logical volumes of a volume
/// group inside a LUKS container, and a plain /boot in front of it.
fn layered_plan(passphrase_file: &Path) -> InstallPlan {
    let plain_root = "[[disks.partitions]]\nid = \"root\"\nfilesystem = { type = \"ext4\", mount_point = \"/\" }\n";
    let layered = format!(
        r#"[[disks.partitions]]
id = "boot"
size = "1G"
filesystem = {{ type = "ext4", mount_point = "/boot" }}

[[disks.partitions]]
id = "system"
encryption = {{ name = "cryptsys", passphrase_file = "{}" }}

[disks.partitions.volume_group]
name = "vg0"

[[disks.partitions.volume_group.logical_volumes]]
name = "root"
size = "8G"
filesystem = {{ type = "ext4", mount_point = "/" }}

[[disks.partitions.volume_group.logical_volumes]]
name = "home"
filesystem = {{ type = "ext4", mount_point = "/home" }}
"#,
        passphrase_file.display()
    );
    let template = get_template("efi-ext4").unwrap().plan;
    assert!(template.contains(plain_root));
    let mut plan = load(&template.replace(plain_root, &layered)).unwrap();
    plan.set_users(vec![]);
    plan
}

fn position(programs: &[String], program: &str) -> usize {
    programs
        .iter()
        .position(|p| p == program)
        .unwrap_or_else(|| panic!("{program} never ran"))
}

fn with_root_size(mut plan: InstallPlan, capacity: ByteSize, root: ByteSize) -> InstallPlan {
    let mut disks = plan.disks().unwrap().to_vec();
    disks[0].capacity = capacity;
    if let Some(p) = disks[0].partitions.iter_mut().find(|p| p.id == *"root") {
        p.size = Some(root);
    }
    plan.set_disks(disks);
    plan
}

fn validation_errors(err: RunError) -> Vec<ValidationError> {
    match err {
        RunError::Validation(errors) => errors,
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn full_musl_plan_completes_and_record_reloads() {
    let h = Harness::new(glibc_host());
    let plan = musl_plan();
    let outcome = h.engine.install(plan.clone(), None).unwrap();

    assert!(outcome.cleanup.is_clean());
    assert!(outcome
        .records
        .iter()
        .all(|r| r.status == StepStatus::Applied));
    assert_eq!(outcome.record.plan(), &plan);

    let record_path = h.target("root/alpinst-setup.toml");
    let mode = fs::metadata(&record_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    let reloaded = load(&fs::read_to_string(&record_path).unwrap()).unwrap();
    assert_eq!(reloaded, plan);

    let programs = h.runner.programs();
    for expected in ["sfdisk", "mkfs.vfat", "mkfs.ext4", "grub-install", "adduser"] {
        assert!(programs.iter().any(|p| p == expected), "{expected} never ran");
    }
    let shadow = fs::read_to_string(h.target("etc/shadow")).unwrap();
    assert!(shadow.starts_with("root:!:"));
    assert!(shadow.contains("alice:$6$rounds=5000$salt$hash:"));
    assert!(h.target("etc/fstab").exists());
    assert!(h.target("etc/hostname").exists());
}

#[test]
fn glibc_host_installs_musl_target_with_musl_tools() {
    let h = Harness::new(glibc_host());
    h.engine.install(musl_plan(), None).unwrap();

    let apk: Vec<_> = h
        .runner
        .invocations()
        .into_iter()
        .filter(|i| i.program.ends_with("apk.static"))
        .collect();
    assert_eq!(apk.len(), 1);
    assert_eq!(apk[0].program, "/usr/lib/alpinst/musl/apk.static");
    let keys_dir = h.target("etc/apk/keys");
    assert!(apk[0]
        .args
        .windows(2)
        .any(|w| w[0] == "--keys-dir" && Path::new(&w[1]) == keys_dir));
    assert!(keys_dir.join(MUSL_KEY).exists());
}

#[test]
fn root_larger_than_disk_is_rejected_before_any_command() {
    let h = Harness::new(glibc_host());
    let plan = with_root_size(musl_plan(), ByteSize::gib(20), ByteSize::gib(25));
    let errors = validation_errors(h.engine.install(plan, None).unwrap_err());

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].step, StepKind::Disk);
    assert_eq!(errors[0].field, "root");
    assert_eq!(errors[0].reason, "exceeds device capacity");
    assert!(h.runner.invocations().is_empty());
}

#[test]
fn empty_username_is_the_only_error() {
    let h = Harness::new(glibc_host());
    let mut plan = musl_plan();
    plan.set_users(vec![UserAccount {
        name: String::new(),
        password: "$6$salt$hash".to_owned(),
        gecos: None,
        admin: false,
    }]);
    let errors = validation_errors(h.engine.install(plan, None).unwrap_err());

    assert_eq!(errors.len(), 1);
    assert_eq!(
        (errors[0].step, errors[0].field.as_str(), errors[0].reason.as_str()),
        (StepKind::Users, "name", "empty")
    );
    assert!(h.runner.invocations().is_empty());
}

#[test]
fn errors_from_every_step_are_aggregated_in_step_order() {
    let environment = StaticEnvironment::new(LibcVariant::Glibc)
        .with_keys(LibcVariant::Musl, &[MUSL_KEY])
        .with_mirror(MAIN, signed(PACKAGES));
    let h = Harness::new(environment);
    let plan = with_root_size(musl_plan(), ByteSize::gib(20), ByteSize::gib(25));
    let errors = validation_errors(h.engine.install(plan, None).unwrap_err());

    let steps: Vec<StepKind> = errors.iter().map(|e| e.step).collect();
    assert_eq!(steps, [StepKind::Disk, StepKind::Mirror]);
    assert!(errors[1].reason.contains("unreachable"));
    assert!(h.runner.invocations().is_empty());
}

#[test]
fn mismatched_key_set_never_reaches_package_install() {
    let environment = glibc_host().with_keys(LibcVariant::Glibc, &["glibc-builder.rsa.pub"]);
    let h = Harness::new(environment);
    let mut plan = musl_plan();
    plan.set_mirror(MirrorSelection {
        url: MAIN.to_owned(),
        key_set: LibcVariant::Glibc,
        extra_repositories: vec![],
    });
    let errors = validation_errors(h.engine.install(plan, None).unwrap_err());

    let integrity: Vec<_> = errors
        .iter()
        .filter(|e| e.kind == ErrorKind::Integrity)
        .collect();
    assert_eq!(integrity.len(), 1);
    assert_eq!(integrity[0].field, "key_set");
    assert!(!h
        .runner
        .invocations()
        .iter()
        .any(|i| i.program.ends_with("apk.static")));
}

#[test]
fn apply_failure_unmounts_in_reverse() {
    let runner = RecordingRunner::new();
    runner.fail_on("grub-install", "cannot find EFI directory");
    let h = Harness::with_runner(glibc_host(), runner);

    let err = h.engine.install(musl_plan(), None).unwrap_err();
    let RunError::Execution { error, cleanup } = err else {
        panic!("expected execution failure, got {err:?}");
    };
    assert_eq!(error.step, StepKind::Bootloader);
    assert!(matches!(
        error.cause,
        RuntimeError::CommandFailed { ref stderr, .. } if stderr == "cannot find EFI directory"
    ));
    assert!(cleanup.is_clean());
    assert!(cleanup.cleaned.contains(&StepKind::Disk));
    assert!(!h.runner.programs().iter().any(|p| p == "adduser"));

    let unmounted = h.umount_targets();
    let root = h.target("").to_string_lossy().trim_end_matches('/').to_owned();
    assert!(unmounted.first().unwrap().ends_with("/sys"));
    assert_eq!(unmounted.last().unwrap().trim_end_matches('/'), root);
    assert_eq!(unmounted.len(), 5);
}

#[test]
fn aborted_run_wipes_the_partition_table_last() {
    let runner = RecordingRunner::new();
    runner.fail_on("grub-install", "cannot find EFI directory");
    let h = Harness::with_runner(glibc_host(), runner);
    h.engine.install(musl_plan(), None).unwrap_err();

    let invocations = h.runner.invocations();
    let wipes: Vec<_> = invocations.iter().filter(|i| i.program == "wipefs").collect();
    assert_eq!(wipes.len(), 1);
    assert_eq!(wipes[0].args, ["--all", "/dev/sda"]);
    let last_umount = invocations.iter().rposition(|i| i.program == "umount").unwrap();
    let wipe = invocations.iter().position(|i| i.program == "wipefs").unwrap();
    assert!(wipe > last_umount);
}

#[test]
fn completed_run_keeps_the_partition_table() {
    let h = Harness::new(glibc_host());
    h.engine.install(musl_plan(), None).unwrap();
    assert!(h.runner.calls_to("wipefs").is_empty());
}

#[test]
fn encrypted_volume_group_installs_and_boots_from_it() {
    let h = Harness::new(layered_host());
    let passphrase = h.dir.path().join("passphrase");
    fs::write(&passphrase, "correct horse\n").unwrap();
    let plan = layered_plan(&passphrase);
    let outcome = h.engine.install(plan, None).unwrap();
    assert!(outcome.cleanup.is_clean());

    let programs = h.runner.programs();
    let order: Vec<usize> = ["sfdisk", "cryptsetup", "pvcreate", "vgcreate", "lvcreate"]
        .iter()
        .map(|p| position(&programs, p))
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{programs:?}");

    let crypt = h.runner.calls_to("cryptsetup");
    assert_eq!(crypt[0].args[0], "luksFormat");
    assert_eq!(crypt[0].args.last().unwrap(), "/dev/sda3");
    assert_eq!(crypt[0].stdin.as_deref(), Some("correct horse\n"));
    assert!(crypt[1].args.starts_with(&["open".to_owned()]));
    assert!(h.runner.calls_to("pvcreate")[0].args.contains(&"/dev/mapper/cryptsys".to_owned()));
    assert_eq!(h.runner.calls_to("lvcreate").len(), 2);
    assert!(h
        .runner
        .calls_to("mount")
        .iter()
        .any(|i| i.args.contains(&"/dev/vg0/root".to_owned())));

    let mkinitfs = fs::read_to_string(h.target("etc/mkinitfs/mkinitfs.conf")).unwrap();
    assert!(mkinitfs.contains("cryptsetup keymap lvm"));
    assert!(fs::symlink_metadata(h.target("etc/runlevels/boot/lvm")).is_ok());
    assert!(!h.target("etc/conf.d/dmcrypt").exists());
    let grub = fs::read_to_string(h.target("etc/default/grub")).unwrap();
    assert!(grub.contains("cryptroot=UUID="));
    assert!(grub.contains("cryptdm=cryptsys"));

    let installed: Vec<String> = h
        .runner
        .invocations()
        .into_iter()
        .filter(|i| i.program.ends_with("apk.static"))
        .flat_map(|i| i.args)
        .collect();
    for package in LAYER_PACKAGES {
        assert!(installed.iter().any(|a| a == package), "{package} not installed");
    }

    assert_eq!(h.runner.calls_to("vgchange")[0].args, ["-an", "vg0"]);
    assert_eq!(h.runner.calls_to("cryptsetup").last().unwrap().args, ["close", "cryptsys"]);
    assert!(h.runner.calls_to("wipefs").is_empty());
}

#[test]
fn aborted_layered_run_closes_layers_before_wiping() {
    let runner = RecordingRunner::new();
    runner.fail_on("grub-install", "cannot find EFI directory");
    let h = Harness::with_runner(layered_host(), runner);
    let passphrase = h.dir.path().join("passphrase");
    fs::write(&passphrase, "correct horse\n").unwrap();
    h.engine.install(layered_plan(&passphrase), None).unwrap_err();

    let invocations = h.runner.invocations();
    let last = |program: &str, first_arg: &str| {
        invocations
            .iter()
            .rposition(|i| i.program == program && i.args.first().is_some_and(|a| a == first_arg))
            .unwrap_or_else(|| panic!("{program} {first_arg} never ran"))
    };
    let unmounted = invocations.iter().rposition(|i| i.program == "umount").unwrap();
    let deactivated = last("vgchange", "-an");
    let closed = last("cryptsetup", "close");
    let wiped = last("wipefs", "--all");
    assert!(unmounted < deactivated && deactivated < closed && closed < wiped);
}

#[test]
fn planned_proxy_reaches_package_install() {
    let h = Harness::new(glibc_host());
    let mut plan = musl_plan();
    let mut network = plan.network().unwrap().clone();
    network.proxy = Some("http://proxy.lan:3128".to_owned());
    plan.set_network(network);
    h.engine.install(plan, None).unwrap();

    let apk: Vec<_> = h
        .runner
        .invocations()
        .into_iter()
        .filter(|i| i.program.ends_with("apk.static"))
        .collect();
    assert_eq!(apk.len(), 1);
    for var in ["http_proxy", "https_proxy"] {
        assert!(
            apk[0].env.iter().any(|(k, v)| k == var && v == "http://proxy.lan:3128"),
            "{var} missing from {:?}",
            apk[0].env
        );
    }
}

#[test]
fn plan_built_without_users_is_incomplete_until_answered() {
    let h = Harness::new(glibc_host());
    let template = musl_plan();
    let mut plan = InstallPlan::new();
    plan.set_keyboard(template.keyboard().unwrap().clone());
    plan.set_network(template.network().unwrap().clone());
    plan.set_disks(template.disks().unwrap().to_vec());
    plan.set_mirror(template.mirror().unwrap().clone());
    plan.set_packages(template.packages().unwrap().clone());
    plan.set_bootloader(template.bootloader().unwrap().clone());

    assert_eq!(plan.missing_sections(), [Section::Users]);
    let errors = h.engine.validate(&plan).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        (errors[0].step, errors[0].field.as_str(), errors[0].reason.as_str()),
        (StepKind::Users, "users", "not answered")
    );

    plan.set_users(vec![]);
    assert!(h.engine.validate(&plan).is_ok());
    assert_eq!(load(&dump(&plan).unwrap()).unwrap(), plan);
}

#[test]
fn cleanup_failure_is_reported_next_to_the_original_error() {
    let runner = RecordingRunner::new();
    runner.fail_on("grub-install", "no space left");
    runner.fail_on("umount", "target is busy");
    let h = Harness::with_runner(glibc_host(), runner);

    let err = h.engine.install(musl_plan(), None).unwrap_err();
    let cleanup = err.cleanup().unwrap().clone();
    assert!(matches!(err, RunError::Execution { ref error, .. } if error.step == StepKind::Bootloader));
    assert_eq!(cleanup.failures.len(), 1);
    assert_eq!(cleanup.failures[0].0, StepKind::Disk);
    assert!(cleanup.failures[0].1.contains("target is busy"));
    assert_eq!(h.umount_targets().len(), 5);
}

#[test]
fn step_timeout_is_an_execution_error() {
    let runner = RecordingRunner::new();
    runner.hang_on("grub-mkconfig");
    let h = Harness::with_runner(glibc_host(), runner);

    let err = h.engine.install(musl_plan(), None).unwrap_err();
    let RunError::Execution { error, .. } = err else {
        panic!("expected execution failure, got {err:?}");
    };
    assert_eq!(error.step, StepKind::Bootloader);
    assert!(matches!(error.cause, RuntimeError::Timeout { ref program, .. } if program == "grub-mkconfig"));
}

#[test]
fn cancelled_run_touches_nothing() {
    let h = Harness::new(glibc_host());
    h.engine.cancel_token().cancel();
    let err = h.engine.install(musl_plan(), None).unwrap_err();
    assert!(matches!(
        err,
        RunError::Cancelled {
            before: StepKind::Keyboard,
            ..
        }
    ));
    assert!(h.runner.invocations().is_empty());
}

#[test]
fn progress_reaches_one_hundred_percent() {
    let h = Harness::new(glibc_host());
    let (tx, rx) = std::sync::mpsc::channel();
    h.engine.install(musl_plan(), Some(tx)).unwrap();
    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(events.len(), StepKind::ALL.len() * 2);
    assert_eq!(events.last().unwrap().percent, 100);
    assert_eq!(events.last().unwrap().step, StepKind::Users);
}

#[test]
fn same_plan_gives_same_record_apart_from_timestamp() {
    let strip = |toml: String| -> String {
        toml.lines()
            .filter(|l| !l.starts_with("installed_at"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let run = || {
        let h = Harness::new(glibc_host());
        let runner = RecordingRunner::new();
        let plan = musl_plan();
        let ctx = h.engine.gather_context(&plan);
        Sequencer::new(&runner, h.engine.config())
            .with_installer_version("9.9.9")
            .run(plan, &ctx)
            .unwrap()
    };
    let a = run();
    let b = run();
    assert_eq!(a.record.installer_version(), "9.9.9");
    assert!(a.record.to_toml().unwrap().contains("installer_version = \"9.9.9\""));
    assert_eq!(a.record.plan_digest(), b.record.plan_digest());
    assert_eq!(
        strip(a.record.to_toml().unwrap()),
        strip(b.record.to_toml().unwrap())
    );
}

#[test]
fn second_installer_is_locked_out() {
    let h = Harness::new(glibc_host());
    let _held = alpinst_core::InstallLock::acquire(&h.engine.config().lock_file).unwrap();
    let err = h.engine.install(musl_plan(), None).unwrap_err();
    assert!(matches!(err, RunError::Fatal(CoreError::Locked(_))));
    assert!(h.runner.invocations().is_empty());
}

#[test]
fn run_state_is_final_after_completion() {
    let h = Harness::new(glibc_host());
    let runner = RecordingRunner::new();
    let mut seq = alpinst_core::Sequencer::new(&runner, h.engine.config());
    let plan = musl_plan();
    let ctx = h.engine.gather_context(&plan);
    seq.run(plan.clone(), &ctx).unwrap();
    assert_eq!(seq.state(), RunState::Completed);
    assert!(matches!(
        seq.run(plan, &ctx),
        Err(RunError::Fatal(CoreError::InvalidTransition { .. }))
    ));
}
