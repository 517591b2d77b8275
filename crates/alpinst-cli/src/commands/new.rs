use super::{json_pretty, write_atomic, EXIT_SUCCESS};
use alpinst_schema::{dump, get_template, list_templates, load, InstallPlan};
use dialoguer::{Confirm, Input, Select};
use std::io::{stderr, stdin, IsTerminal};
use std::path::Path;

fn load_template(name: &str) -> Result<InstallPlan, String> {
    let tpl = get_template(name).ok_or_else(|| {
        let names: Vec<&str> = list_templates().into_iter().map(|(n, _)| n).collect();
        format!("unknown template '{name}' (expected: {})", names.join(", "))
    })?;
    load(tpl.plan).map_err(|e| format!("template parse error: {e}"))
}

fn ensure_can_write(dest: &Path, force: bool, is_tty: bool) -> Result<(), String> {
    if !dest.exists() || force {
        return Ok(());
    }
    let refusal = format!("refusing to overwrite existing {} (pass --force)", dest.display());
    if !is_tty {
        return Err(refusal);
    }
    let overwrite = Confirm::new()
        .with_prompt(format!("overwrite {}?", dest.display()))
        .default(false)
        .interact()
        .map_err(|e| format!("prompt failed: {e}"))?;
    if overwrite {
        Ok(())
    } else {
        Err(refusal)
    }
}

fn choose_template() -> Result<&'static str, String> {
    let templates = list_templates();
    let items: Vec<String> = templates
        .iter()
        .map(|(name, desc)| format!("{name:<16} {desc}"))
        .collect();
    let idx = Select::new()
        .with_prompt("plan template")
        .items(&items)
        .default(0)
        .interact()
        .map_err(|e| format!("prompt failed: {e}"))?;
    Ok(templates[idx].0)
}

/// Point the template at the machine in front of the user.
fn customize(plan: &mut InstallPlan) -> Result<(), String> {
    if let Some(mut network) = plan.network().cloned() {
        network.hostname = Input::new()
            .with_prompt("hostname")
            .default(network.hostname)
            .interact_text()
            .map_err(|e| format!("prompt failed: {e}"))?;
        plan.set_network(network);
    }
    let Some(mut disks) = plan.disks().map(<[_]>::to_vec) else {
        return Ok(());
    };
    let Some(first) = disks.first_mut() else {
        return Ok(());
    };
    let old = first.device.clone();
    let device: String = Input::new()
        .with_prompt("target disk")
        .default(old.clone())
        .interact_text()
        .map_err(|e| format!("prompt failed: {e}"))?;
    first.device.clone_from(&device);
    plan.set_disks(disks);
    if let Some(mut boot) = plan.bootloader().cloned() {
        if boot.device == old {
            boot.device = device;
            plan.set_bootloader(boot);
        }
    }
    Ok(())
}

fn print_result(dest: &Path, template: &str, json: bool) -> Result<(), String> {
    if json {
        let payload = serde_json::json!({
            "status": "written",
            "path": dest.display().to_string(),
            "template": template,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("wrote {} from template '{template}'", dest.display());
        println!("review it, then run: alpinst validate {}", dest.display());
    }
    Ok(())
}

pub fn list(json: bool) -> Result<u8, String> {
    let templates = list_templates();
    if json {
        let payload: Vec<_> = templates
            .iter()
            .map(|(name, desc)| serde_json::json!({ "name": name, "description": desc }))
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (name, desc) in templates {
            println!("{name:<16} {desc}");
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn run(template: Option<&str>, dest: &Path, force: bool, json: bool) -> Result<u8, String> {
    let is_tty = stdin().is_terminal() && stderr().is_terminal();

    let name = match template {
        Some(name) => name,
        None if is_tty => choose_template()?,
        None => return Err("no template given and stdin is not a TTY (see --list)".to_owned()),
    };
    let mut plan = load_template(name)?;
    ensure_can_write(dest, force, is_tty)?;

    let text = if is_tty && !json {
        customize(&mut plan)?;
        dump(&plan).map_err(|e| e.to_string())?
    } else {
        get_template(name).map_or_else(String::new, |t| t.plan.to_owned())
    };
    write_atomic(dest, &text)?;
    print_result(dest, name, json)?;
    Ok(EXIT_SUCCESS)
}
