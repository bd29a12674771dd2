use std::io::IsTerminal;

use clap::Parser;
use facet::Facet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lab::backend;
use lab::cli::{Cli, Command, ListTarget, OutputFormat};
use lab::config::{self, Config};
use lab::error::LabError;
use lab::logging;
use lab::orchestrator::Orchestrator;
use lab::progress::{OutputMode, Progress};
use lab::registry::Registry;
use lab::remote::ssh::SshShell;
use lab::report;
use lab::scaffold::{self, VmScaffold};
use lab::vm_state::Bucket;

#[derive(Facet)]
struct OutcomeJson {
    id: String,
    state: String,
}

#[derive(Facet)]
struct PathJson {
    path: String,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let output_format = resolve_output_format(cli.output);
    let mode = resolve_output_mode(output_format, cli.verbose, cli.quiet);

    // Spinners own the terminal in Normal/Quiet; stderr logging would break
    // indicatif's redraws.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("lab=debug,info"),
        OutputMode::Normal | OutputMode::Quiet | OutputMode::Silent => EnvFilter::new("off"),
        OutputMode::Plain => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lab=info"))
        }
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always lab=debug, discards until a log file is set
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("lab=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let config = config::resolve_config(cli.config.as_deref(), cli.base_dir.as_deref())?;
    let layout = config.layout();

    // Only commands that change state are worth a log file.
    let mutating = matches!(
        cli.command,
        Command::Start { .. }
            | Command::Stop { .. }
            | Command::Save { .. }
            | Command::Resume { .. }
            | Command::CreateVm { .. }
            | Command::Init
    );
    if mutating && layout.base().is_dir() {
        let logs_dir = layout.logs_dir();
        std::fs::create_dir_all(&logs_dir).ok();
        file_handle.set_file(&logs_dir.join("lab.log")).ok();
    }

    let json = output_format == OutputFormat::Json;

    match cli.command {
        Command::Init => {
            let created = scaffold::init(&layout)?;
            if json {
                let paths: Vec<String> = created.iter().map(|p| p.display().to_string()).collect();
                println!("{}", report::list_json(&paths)?);
            } else if created.is_empty() {
                println!("[*] {} is already initialised", layout.base().display());
            } else {
                for dir in &created {
                    println!("[*] created {}", dir.display());
                }
            }
        }
        Command::List { target } => {
            let names = match target {
                ListTarget::Categories => Registry::new(layout).list_categories()?,
                ListTarget::Active => orchestrator(&config, mode).list_exercises(Bucket::Active)?,
                ListTarget::Suspended => {
                    orchestrator(&config, mode).list_exercises(Bucket::Suspended)?
                }
            };
            print_list(&names, json)?;
        }
        Command::ListLabs { category } => {
            let names = Registry::new(layout).list_labs(&category)?;
            print_list(&names, json)?;
        }
        Command::Info { first, lab } => {
            let orch = orchestrator(&config, mode);
            match lab {
                Some(lab) => {
                    let report = orch.template_info(&first, &lab)?;
                    emit(json, || report.render(), || report.to_json())?;
                }
                None => {
                    let report = orch.info(&first)?;
                    emit(json, || report.render(), || report.to_json())?;
                }
            }
        }
        Command::Start { category, lab } => {
            let report = orchestrator(&config, mode).start(&category, &lab).await?;
            emit(json, || report.render(), || report.to_json())?;
        }
        Command::Stop { id } => {
            let record = orchestrator(&config, mode).stop(&id).await?;
            emit_outcome(json, &record.id, "stopped")?;
        }
        Command::Save { id } => {
            let record = orchestrator(&config, mode).suspend(&id).await?;
            emit_outcome(json, &record.id, record.state.describe())?;
        }
        Command::Resume { id } => {
            let report = orchestrator(&config, mode).resume(&id).await?;
            emit(json, || report.render(), || report.to_json())?;
        }
        Command::CreateLab { category, name } => {
            let dir = scaffold::create_lab(&layout, &category, &name)?;
            emit_path(json, "lab created at", &dir)?;
        }
        Command::CreateVm {
            category,
            lab,
            name,
            os_variant,
            size,
            cpus,
            memory,
            existing_qcow2,
            iso,
        } => {
            let request = VmScaffold {
                category,
                lab,
                name,
                os_variant,
                size: size.unwrap_or_else(|| config.defaults.disk_size.clone()),
                cpus: cpus.unwrap_or(config.defaults.cpus),
                memory_mb: memory.unwrap_or(config.defaults.memory_mb),
                existing_qcow2,
                iso,
            };
            let libvirt = backend::create_backend(&config);
            let dir = scaffold::create_vm(&layout, &libvirt, &request).await?;
            emit_path(json, "VM created at", &dir)?;
            if !json {
                println!("[*] fill in the credentials in details.yaml before starting the lab");
            }
        }
    }

    Ok(())
}

fn orchestrator(config: &Config, mode: OutputMode) -> Orchestrator<backend::libvirt::LibvirtBackend, SshShell> {
    Orchestrator::new(
        config.clone(),
        backend::create_backend(config),
        SshShell::new(&config.ssh),
        Progress::new(mode),
    )
}

fn emit(
    json: bool,
    text: impl FnOnce() -> String,
    as_json: impl FnOnce() -> Result<String, LabError>,
) -> Result<(), LabError> {
    if json {
        println!("{}", as_json()?);
    } else {
        print!("{}", text());
    }
    Ok(())
}

fn print_list(names: &[String], json: bool) -> Result<(), LabError> {
    emit(json, || report::render_list(names), || report::list_json(names))
}

fn emit_outcome(json: bool, id: &str, state: &str) -> Result<(), LabError> {
    emit(
        json,
        || format!("[*] exercise {id} {state}\n"),
        || {
            facet_json::to_string(&OutcomeJson {
                id: id.to_string(),
                state: state.to_string(),
            })
            .map_err(|e| LabError::Render {
                message: e.to_string(),
            })
        },
    )
}

fn emit_path(json: bool, label: &str, path: &std::path::Path) -> Result<(), LabError> {
    emit(
        json,
        || format!("[*] {label} {}\n", path.display()),
        || {
            facet_json::to_string(&PathJson {
                path: path.display().to_string(),
            })
            .map_err(|e| LabError::Render {
                message: e.to_string(),
            })
        },
    )
}

fn resolve_output_format(format: OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if !std::io::stdout().is_terminal() || !std::io::stdin().is_terminal() {
                OutputFormat::Plain
            } else {
                OutputFormat::Interactive
            }
        }
        other => other,
    }
}

/// Map the resolved output format plus `--verbose`/`--quiet` onto the
/// progress renderer's mode.
fn resolve_output_mode(format: OutputFormat, verbose: bool, quiet: bool) -> OutputMode {
    match format {
        // stdout carries the JSON document and nothing else.
        OutputFormat::Json => OutputMode::Silent,
        OutputFormat::Plain if quiet => OutputMode::Silent,
        OutputFormat::Plain if verbose => OutputMode::Verbose,
        OutputFormat::Plain => OutputMode::Plain,
        _ if quiet => OutputMode::Quiet,
        _ if verbose => OutputMode::Verbose,
        _ => OutputMode::Normal,
    }
}
