use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};

use roleback::cli::{Cli, Commands, ConfigCommands};
use roleback::core::retry::Validation;
use roleback::core::runtime::{ResourceKind, WorkloadRuntime};
use roleback::core::{
    classify, generate_restore_guide, ArchivalSink, Catalog, DockerRuntime, InstanceLock,
    Orchestrator, ResticSink, RestoreStep, RunReport, RunSettings, SystemRunner,
};
use roleback::utils::{
    format_bytes, format_duration, host_name, init_logging, is_sensitive_key, mask_sensitive,
    AppConfig, CATALOG_FILE,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Backup => {
            handle_backup(config_path).await?;
        }
        Commands::Extract {
            snapshot,
            name,
            dest,
        } => {
            handle_extract(config_path, snapshot, name, dest).await?;
        }
        Commands::Guide { extracted, catalog } => {
            handle_guide(config_path, extracted, catalog)?;
        }
        Commands::Inspect { show_secrets } => {
            handle_inspect(show_secrets).await?;
        }
        Commands::Classify { image } => {
            let engine = classify(&image);
            println!("{}", engine.map(|e| e.as_str()).unwrap_or("none"));
        }
        Commands::Config { command } => {
            handle_config(config_path, command)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = AppConfig::load(path).context("failed to load configuration")?;
    config
        .load_env_file()
        .context("failed to load environment file")?;
    Ok(config)
}

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> Result<&'static str> {
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            Ok("SIGINT")
        }
        _ = term.recv() => Ok("SIGTERM"),
    }
}

async fn handle_backup(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let repository = config.sink_repository()?;

    let _lock = InstanceLock::acquire(&config.lock_file)?;

    let hostname = host_name();
    let settings = RunSettings::from_config(&config, hostname.as_str())?;
    let runtime = DockerRuntime::connect()?;
    let runner = SystemRunner;
    let sink = ResticSink::new(&runner, config.sink.binary.as_str(), repository, hostname.as_str());
    let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings);

    println!("Starting backup run on {}\n", hostname.bold());
    let started = Instant::now();

    let report = tokio::select! {
        result = orchestrator.run() => result?,
        signal = shutdown_signal() => {
            let signal = signal?;
            tracing::error!(signal, "run interrupted, working directory removed");
            bail!("backup interrupted by {}", signal);
        }
    };

    print_report(&report, started.elapsed().as_secs());
    Ok(())
}

fn print_report(report: &RunReport, elapsed: u64) {
    println!("{} {}", "✓".green().bold(), "Backup complete".bold());
    println!("  Snapshot:  {}", report.snapshot_id.cyan());
    println!("  Archive:   {}", report.archive_name);
    println!(
        "  Workloads: {}  Volumes: {}  Binds: {}",
        report.catalog.containers.len(),
        report.catalog.backed_up_volumes.len(),
        report.catalog.backed_up_binds.len()
    );
    println!("  Duration:  {}", format_duration(elapsed));

    if !report.dumps.is_empty() {
        println!("\nDatabase dumps:");
        for dump in &report.dumps {
            let marker = if matches!(dump.validation, Validation::Ok { .. }) {
                "✓".green()
            } else {
                "!".yellow()
            };
            println!(
                "  {} {:<25} {:<10} {}",
                marker,
                dump.workload,
                dump.engine.as_str(),
                format_bytes(dump.size)
            );
        }
    }

    for (workload, save) in &report.redis {
        println!("  {} {:<25} redis      {:?}", "·".dimmed(), workload, save);
    }

    if !report.skipped_workloads.is_empty() {
        println!("\nSkipped workloads:");
        for id in &report.skipped_workloads {
            println!("  {} {}", "-".yellow(), id);
        }
    }

    if !report.skipped_resources.is_empty() {
        println!("\nSkipped resources:");
        for note in &report.skipped_resources {
            println!("  {} {} {} ({}): {}", "-".dimmed(), note.kind, note.identity, note.workload, note.reason);
        }
    }

    if !report.failed_resources.is_empty() {
        println!("\n{}", "Resources not archived:".yellow().bold());
        for note in &report.failed_resources {
            println!("  {} {} {} ({}): {}", "✗".red(), note.kind, note.identity, note.workload, note.reason);
        }
    }
}

async fn handle_extract(
    config_path: Option<&Path>,
    snapshot: String,
    name: Option<String>,
    dest: PathBuf,
) -> Result<()> {
    let config = load_config(config_path)?;
    let repository = config.sink_repository()?;
    let runner = SystemRunner;
    let sink = ResticSink::new(&runner, config.sink.binary.as_str(), repository, host_name());

    let name = match name {
        Some(name) => name,
        None => {
            let mut names = sink.archives(&snapshot).await?;
            match names.len() {
                1 => names.remove(0),
                0 => bail!("snapshot {} carries no archive name, pass --name", snapshot),
                _ => bail!(
                    "snapshot {} holds several archives ({}), pass --name",
                    snapshot,
                    names.join(", ")
                ),
            }
        }
    };

    std::fs::create_dir_all(&dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;

    println!("Extracting {} from snapshot {}...", name, snapshot);
    sink.retrieve(&snapshot, &name, &dest).await?;

    println!("{} Extracted to {}", "✓".green(), dest.display());
    println!("\nNext: roleback guide --extracted {}", dest.display());
    Ok(())
}

fn handle_guide(config_path: Option<&Path>, extracted: PathBuf, catalog: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(config_path).context("failed to load configuration")?;
    let catalog_path = catalog.unwrap_or_else(|| extracted.join(CATALOG_FILE));
    let catalog = Catalog::load(&catalog_path)?;
    let guide = generate_restore_guide(&catalog, &extracted);

    println!("{}", "Restore guide".bold());
    println!("  Host:      {}", catalog.hostname);
    println!("  Generated: {}", catalog.generated.to_rfc3339());
    println!("  Workloads: {}", catalog.containers.len());
    println!("\nNothing below is executed. Credentials come from the catalog.\n");

    for (i, step) in guide.steps.iter().enumerate() {
        let marker = match step {
            RestoreStep::MissingArtifact { .. } | RestoreStep::MissingArchive { .. } => "!".yellow().bold(),
            RestoreStep::Cache { .. } => "·".dimmed(),
            RestoreStep::Database { .. } => "▸".cyan(),
            RestoreStep::Resource { kind: ResourceKind::Volume, .. } => "▸".blue(),
            RestoreStep::Resource { kind: ResourceKind::Bind, .. } => "▸".magenta(),
        };
        println!("{:>3}. {} {}", i + 1, marker, step);
        for command in step.commands(&config.archive_image) {
            println!("       $ {}", command);
        }
    }

    if guide.warnings() > 0 {
        println!(
            "\n{} {} expected artifact(s) are missing from the extraction",
            "!".yellow().bold(),
            guide.warnings()
        );
    }

    println!("\nExtracted artifacts:");
    for artifact in &guide.artifacts {
        println!("  {}", artifact.display());
    }

    Ok(())
}

async fn handle_inspect(show_secrets: bool) -> Result<()> {
    let runtime = DockerRuntime::connect()?;
    let ids = runtime.list_running().await?;

    println!("{} running workload(s)\n", ids.len());

    for id in ids {
        let workload = match runtime.inspect(&id).await {
            Ok(workload) => workload,
            Err(err) => {
                println!("{} {}: {}", "!".yellow(), id, err);
                continue;
            }
        };

        let engine = classify(&workload.image)
            .map(|e| e.as_str())
            .unwrap_or("none");
        println!("{} {} ({})", workload.id.bold(), workload.image.dimmed(), engine.cyan());

        for resource in &workload.resources {
            println!("    {:<7} {} -> {}", resource.kind, resource.identity, resource.destination);
        }
        for (key, value) in &workload.env {
            let shown = if !show_secrets && is_sensitive_key(key) {
                mask_sensitive(value, 2)
            } else {
                value.clone()
            };
            println!("    env     {}={}", key, shown);
        }
        println!();
    }

    Ok(())
}

fn handle_config(config_path: Option<&Path>, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = AppConfig::load(config_path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Path => {
            let path = match config_path {
                Some(path) => path.to_path_buf(),
                None => AppConfig::config_path()?,
            };
            println!("{}", path.display());
        }
    }
    Ok(())
}
