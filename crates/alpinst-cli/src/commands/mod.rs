pub mod completions;
pub mod doctor;
pub mod install;
pub mod interactive;
pub mod man_pages;
pub mod new;
pub mod validate;

use alpinst_core::{
    install_signal_handler, Engine, ProgressEvent, RunError, RunOutcome, StepStatus,
    ValidationError,
};
use alpinst_runtime::mock::dry_run_root;
use alpinst_runtime::{
    check_install_prereqs, check_layer_prereqs, format_missing, CommandRunner, InstallerConfig,
    Invocation, RecordingRunner, SystemEnvironment,
};
use alpinst_schema::{dump_record, InstallPlan};
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_VALIDATION: u8 = 3;
pub const EXIT_EXECUTION: u8 = 4;
pub const EXIT_CANCELLED: u8 = 5;

pub const SKIP_PREREQS_ENV: &str = "ALPINST_SKIP_PREREQS";

pub fn exit_code(err: &RunError) -> u8 {
    match err {
        RunError::Validation(_) => EXIT_VALIDATION,
        RunError::Execution { .. } | RunError::Record { .. } => EXIT_EXECUTION,
        RunError::Cancelled { .. } => EXIT_CANCELLED,
        RunError::Fatal(_) => EXIT_FAILURE,
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// `--config`, else `ALPINST_CONFIG`, else the system file, else defaults.
pub fn load_config(path: Option<&Path>) -> Result<InstallerConfig, String> {
    match path {
        Some(p) => InstallerConfig::load(p),
        None => InstallerConfig::load_default(),
    }
    .map_err(|e| e.to_string())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: StepStatus) -> String {
    let text = status.to_string();
    match status {
        StepStatus::Applied => Style::new().green().apply_to(text).to_string(),
        StepStatus::Validated => Style::new().cyan().apply_to(text).to_string(),
        StepStatus::Failed => Style::new().red().bold().apply_to(text).to_string(),
        StepStatus::Pending => Style::new().dim().apply_to(text).to_string(),
    }
}

/// Write through a temp file in the destination directory, then rename.
pub fn write_atomic(dest: &Path, content: &str) -> Result<(), String> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| format!("write temp file: {e}"))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| format!("write temp file: {e}"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| format!("fsync temp file: {e}"))?;
    tmp.persist(dest)
        .map_err(|e| format!("persist {}: {}", dest.display(), e.error))?;
    Ok(())
}

/// Refuse to start a real install when host tools are missing.
pub fn check_prereqs(plan: &InstallPlan) -> Result<(), String> {
    if std::env::var(SKIP_PREREQS_ENV).as_deref() == Ok("1") {
        return Ok(());
    }
    let mut missing = check_install_prereqs(&plan.filesystem_types());
    missing.extend(check_layer_prereqs(plan.uses_encryption(), plan.uses_lvm()));
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format_missing(&missing))
    }
}

struct DryRun {
    _root: tempfile::TempDir,
    runner: Arc<RecordingRunner>,
}

/// The engine a front-end drives. A dry run stages into a throwaway
/// directory and records commands instead of running them.
pub struct Target {
    pub engine: Engine,
    dry_run: Option<DryRun>,
}

impl Target {
    pub fn new(config: InstallerConfig, dry_run: bool) -> Result<Self, String> {
        if !dry_run {
            return Ok(Self {
                engine: Engine::new(config),
                dry_run: None,
            });
        }
        let (dir, root) = dry_run_root().map_err(|e| format!("cannot create dry-run root: {e}"))?;
        debug!("dry run: staging under {}", root.display());
        let config = InstallerConfig {
            staging_root: root,
            lock_file: dir.path().join("alpinst.lock"),
            ..config
        };
        let runner = Arc::new(RecordingRunner::new());
        let environment = Arc::new(SystemEnvironment::new(&config));
        let engine = Engine::with_parts(
            config,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            environment,
        );
        Ok(Self {
            engine,
            dry_run: Some(DryRun { _root: dir, runner }),
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.is_some()
    }

    /// Commands a dry run would have executed, in order.
    pub fn recorded_commands(&self) -> Vec<String> {
        self.dry_run
            .as_ref()
            .map(|d| d.runner.invocations().iter().map(Invocation::display).collect())
            .unwrap_or_default()
    }
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("{bar:30.cyan/blue} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

fn render(pb: &ProgressBar, event: &ProgressEvent) {
    pb.set_position(u64::from(event.percent));
    if event.status == StepStatus::Failed {
        pb.println(format!(
            "{} {}",
            Style::new().red().apply_to("✗"),
            event.message
        ));
    } else {
        pb.set_message(event.message.clone());
    }
}

/// Run the install on a worker thread and render progress here until it
/// finishes.
pub fn execute(
    target: &Target,
    plan: InstallPlan,
    record: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    install_signal_handler(target.engine.cancel_token());
    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let pb = (!json).then(progress_bar);

    let result = std::thread::scope(|s| {
        let worker = s.spawn(move || target.engine.install(plan, Some(tx)));
        for event in rx {
            if let Some(pb) = &pb {
                render(pb, &event);
            }
        }
        worker.join()
    })
    .map_err(|_| "installer thread panicked".to_owned())?;

    match result {
        Ok(outcome) => {
            if let Some(pb) = &pb {
                spin_ok(pb, "installation completed");
            }
            if let Some(path) = record {
                let text = dump_record(&outcome.record).map_err(|e| e.to_string())?;
                write_atomic(path, &text)?;
            }
            report_success(target, &outcome, record, json)?;
            Ok(EXIT_SUCCESS)
        }
        Err(err) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "installation failed");
            }
            report_failure(&err, json)?;
            Ok(exit_code(&err))
        }
    }
}

fn report_success(
    target: &Target,
    outcome: &RunOutcome,
    record: Option<&Path>,
    json: bool,
) -> Result<(), String> {
    let commands = target.recorded_commands();
    if json {
        let payload = serde_json::json!({
            "status": "completed",
            "dry_run": target.is_dry_run(),
            "plan_digest": outcome.record.plan_digest().as_str(),
            "installed_at": outcome.record.installed_at().to_rfc3339(),
            "steps": outcome.records.iter().map(|r| serde_json::json!({
                "step": r.kind,
                "status": r.status,
            })).collect::<Vec<_>>(),
            "cleanup_failures": outcome.cleanup.failures.iter().map(|(step, reason)| serde_json::json!({
                "step": step,
                "reason": reason,
            })).collect::<Vec<_>>(),
            "commands": commands,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(());
    }

    for r in &outcome.records {
        println!("  {:<12} {}", r.kind.name(), colorize_status(r.status));
    }
    println!("plan digest: {}", outcome.record.plan_digest().short());
    if let Some(path) = record {
        println!("setup record written to {}", path.display());
    }
    if !outcome.cleanup.is_clean() {
        eprintln!("warning: {}", outcome.cleanup);
    }
    if target.is_dry_run() {
        println!("dry run: {} command(s) would have run:", commands.len());
        for c in &commands {
            println!("  {c}");
        }
    }
    Ok(())
}

pub fn print_validation_errors(errors: &[ValidationError], json: bool) -> Result<(), String> {
    if json {
        let payload = serde_json::json!({
            "status": "invalid",
            "errors": errors,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(());
    }
    let red = Style::new().red();
    eprintln!("plan validation failed with {} error(s):", errors.len());
    for e in errors {
        let marker = if e.is_integrity() { " [integrity]" } else { "" };
        eprintln!("  {} {e}{marker}", red.apply_to("✗"));
    }
    Ok(())
}

fn report_failure(err: &RunError, json: bool) -> Result<(), String> {
    if let RunError::Validation(errors) = err {
        return print_validation_errors(errors, json);
    }
    if json {
        let payload = serde_json::json!({
            "status": match err {
                RunError::Cancelled { .. } => "cancelled",
                _ => "failed",
            },
            "error": err.to_string(),
            "cleanup": err.cleanup().map(ToString::to_string),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(());
    }
    eprintln!("error: {err}");
    if let Some(cleanup) = err.cleanup() {
        if cleanup.is_clean() {
            eprintln!("{cleanup}");
        } else {
            eprintln!("warning: {cleanup}");
        }
    }
    Ok(())
}
