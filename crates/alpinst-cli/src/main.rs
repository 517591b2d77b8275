mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "alpinst",
    version,
    about = "Declarative installer for Alpine Linux with musl and glibc targets"
)]
struct Cli {
    /// Installer configuration file (default: $ALPINST_CONFIG, then /etc/alpinst/installer.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    /// Write a timestamped debug log to this file instead of the terminal.
    #[arg(long, global = true)]
    debug_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install a system from a plan file without asking questions.
    Install {
        /// Path to the plan TOML file.
        plan: PathBuf,
        /// Validate and record every command instead of running it.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Also write the setup record to this path on the host.
        #[arg(long)]
        record: Option<PathBuf>,
        /// Do not copy the setup record into the installed system.
        #[arg(long, default_value_t = false)]
        no_record_copy: bool,
    },
    /// Build a plan by answering questions, then install it.
    Interactive {
        /// Write the finished plan to this path before installing.
        #[arg(long)]
        save_plan: Option<PathBuf>,
        /// Validate and record every command instead of running it.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Check a plan against this machine without changing anything.
    Validate {
        /// Path to the plan TOML file.
        plan: PathBuf,
    },
    /// Write a plan file from a built-in template.
    New {
        /// Template name (see --list).
        #[arg(long)]
        template: Option<String>,
        /// Destination plan file.
        #[arg(short, long, default_value = "alpinst.toml")]
        output: PathBuf,
        /// Overwrite an existing file without asking.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// List the built-in templates.
        #[arg(long, default_value_t = false)]
        list: bool,
    },
    /// Check host tools, signing keys and installer configuration.
    Doctor {
        /// Also validate this plan file.
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages.
    ManPages {
        /// Output directory.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    if let Err(msg) = init_logging(&cli) {
        eprintln!("error: {msg}");
        return ExitCode::from(EXIT_FAILURE);
    }

    let config = cli.config.as_deref();
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Install {
            plan,
            dry_run,
            record,
            no_record_copy,
        } => commands::install::run(
            config,
            &commands::install::InstallArgs {
                plan: &plan,
                dry_run,
                record: record.as_deref(),
                no_record_copy,
            },
            json_output,
        ),
        Commands::Interactive { save_plan, dry_run } => {
            commands::interactive::run(config, save_plan.as_deref(), dry_run, json_output)
        }
        Commands::Validate { plan } => commands::validate::run(config, &plan, json_output),
        Commands::New {
            template,
            output,
            force,
            list,
        } => {
            if list {
                commands::new::list(json_output)
            } else {
                commands::new::run(template.as_deref(), &output, force, json_output)
            }
        }
        Commands::Doctor { plan } => commands::doctor::run(config, plan.as_deref(), json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("plan error:")
                || msg.starts_with("failed to parse plan")
                || msg.starts_with("failed to read plan")
                || msg.starts_with("config error:")
            {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn init_logging(cli: &Cli) -> Result<(), String> {
    if let Some(path) = &cli.debug_log {
        let file = std::fs::File::create(path)
            .map_err(|e| format!("cannot create debug log {}: {e}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env("ALPINST_LOG")
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
        return Ok(());
    }

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ALPINST_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
