use super::{check_prereqs, execute, load_config, Target};
use alpinst_schema::load_file;
use std::path::Path;
use tracing::info;

pub struct InstallArgs<'a> {
    pub plan: &'a Path,
    pub dry_run: bool,
    pub record: Option<&'a Path>,
    pub no_record_copy: bool,
}

pub fn run(config_path: Option<&Path>, args: &InstallArgs<'_>, json: bool) -> Result<u8, String> {
    let mut config = load_config(config_path)?;
    let plan = load_file(args.plan).map_err(|e| e.to_string())?;
    if args.no_record_copy {
        config.copy_record = false;
    }
    if !args.dry_run {
        check_prereqs(&plan)?;
    }
    info!("installing from {}", args.plan.display());
    let target = Target::new(config, args.dry_run)?;
    execute(&target, plan, args.record, json)
}
