use super::{
    json_pretty, load_config, print_validation_errors, spin_fail, spin_ok, spinner,
    EXIT_SUCCESS, EXIT_VALIDATION,
};
use alpinst_core::steps::package_list;
use alpinst_core::Engine;
use alpinst_schema::load_file;
use std::path::Path;

pub fn run(config_path: Option<&Path>, plan_path: &Path, json: bool) -> Result<u8, String> {
    let config = load_config(config_path)?;
    let plan = load_file(plan_path).map_err(|e| e.to_string())?;
    let engine = Engine::new(config);

    let pb = (!json).then(|| spinner("fetching mirror indexes and validating plan..."));
    match engine.validate(&plan) {
        Ok(ctx) => {
            let packages = package_list(&plan, &ctx.base_packages);
            if let Some(pb) = &pb {
                spin_ok(pb, "plan is valid");
            }
            if json {
                let payload = serde_json::json!({
                    "status": "valid",
                    "host": ctx.host,
                    "target_libc": plan.target_libc(),
                    "packages": packages,
                });
                println!("{}", json_pretty(&payload)?);
            } else {
                println!(
                    "host: {} {} ({} firmware)",
                    ctx.host.arch, ctx.host.libc, ctx.host.firmware
                );
                if let Some(libc) = plan.target_libc() {
                    println!("target: {libc}");
                }
                println!("{} package(s) will be installed", packages.len());
            }
            Ok(EXIT_SUCCESS)
        }
        Err(errors) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "plan is invalid");
            }
            print_validation_errors(&errors, json)?;
            Ok(EXIT_VALIDATION)
        }
    }
}
