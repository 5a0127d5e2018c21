use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use converter::{
    config::{ConvertConfig, Transport},
    run_conversion, scan_inventory, Inventory, RunSummary,
};
use humansize::{format_size, DECIMAL};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use log::{info, warn};

/// Number of missing files listed by `status` before summarising the rest
const STATUS_PREVIEW: usize = 10;

/// Exit code after a second Ctrl-C, as a shell reports death by SIGINT
const FORCED_EXIT_CODE: i32 = 130;

/// Batch-convert media files on a remote host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert every source that has no output yet
    Run(RunArgs),
    /// Show how many sources still need converting, without connecting
    Status(StatusArgs),
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Directory holding the source files (overrides config)
    #[arg(short = 'd', long)]
    local_dir: Option<PathBuf>,

    /// Remote host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Remote user (overrides config)
    #[arg(long)]
    user: Option<String>,

    /// Number of items processed concurrently
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run conversions on this machine instead of over ssh
    #[arg(long)]
    local: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Also write the JSON summary to this file
    #[arg(long)]
    summary_file: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct StatusArgs {
    /// Directory holding the source files (overrides config)
    #[arg(short = 'd', long)]
    local_dir: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    directory: PathBuf,
    total: usize,
    converted: usize,
    missing: Vec<String>,
    pending_bytes: u64,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose raises the default to debug
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = ConvertConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Run(run) => {
            apply_run_overrides(&mut cfg, &run);
            cmd_run(cfg, &run).await
        }
        Command::Status(status) => {
            if let Some(dir) = status.local_dir {
                cfg.local_dir = dir;
            }
            cmd_status(&cfg, status.json)
        }
    }
}

fn apply_run_overrides(cfg: &mut ConvertConfig, run: &RunArgs) {
    if let Some(dir) = &run.local_dir {
        cfg.local_dir = dir.clone();
    }
    if let Some(host) = &run.host {
        cfg.remote.host = host.clone();
    }
    if let Some(user) = &run.user {
        cfg.remote.user = Some(user.clone());
    }
    if let Some(workers) = run.workers {
        cfg.workers = workers;
    }
    if run.local {
        cfg.transport = Transport::Local;
    }
}

async fn cmd_run(cfg: ConvertConfig, run: &RunArgs) -> Result<ExitCode> {
    info!("Remote converter starting");
    info!("Configuration loaded:");
    info!("  Local dir: {}", cfg.local_dir.display());
    info!("  Formats: .{} -> .{}", cfg.source_ext, cfg.target_ext);
    match cfg.transport {
        Transport::Ssh => info!("  Remote: {} (port {})", cfg.remote.destination(), cfg.remote.port),
        Transport::Local => info!("  Remote: local shell"),
    }
    info!("  Workers: {}", cfg.workers);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("🛑 Interrupt received, finishing in-flight items then cleaning up (Ctrl-C again to quit now)");
        on_signal.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Second interrupt, exiting without remote cleanup");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });

    let summary = run_conversion(&cfg, cancel).await?;

    if let Some(path) = &run.summary_file {
        write_summary(path, &summary)?;
    }

    if run.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }

    if summary.all_succeeded() {
        println!("\n=== SUCCESS: {} file(s) converted ===", summary.succeeded);
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write summary file: {}", path.display()))?;
    Ok(())
}

/// File names of the pending sources exactly as they appear on disk
fn missing_file_names(inventory: &Inventory) -> Vec<String> {
    inventory
        .pending
        .iter()
        .map(|p| match p.source_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => p.source_name.clone(),
        })
        .collect()
}

fn cmd_status(cfg: &ConvertConfig, json: bool) -> Result<ExitCode> {
    let inventory = scan_inventory(cfg)?;
    let report = StatusReport {
        directory: cfg.local_dir.clone(),
        total: inventory.total_sources(),
        converted: inventory.converted.len(),
        missing: missing_file_names(&inventory),
        pending_bytes: inventory.pending_bytes(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Total .{} files: {}", cfg.source_ext, report.total);
    println!("Already converted: {}", report.converted);
    println!(
        "Missing .{} files: {} ({} to upload)",
        cfg.target_ext,
        report.missing.len(),
        format_size(report.pending_bytes, DECIMAL)
    );

    if !report.missing.is_empty() {
        println!("\nMissing files:");
        for m in report.missing.iter().take(STATUS_PREVIEW) {
            println!("- {}", m);
        }
        if report.missing.len() > STATUS_PREVIEW {
            println!("... and {} more", report.missing.len() - STATUS_PREVIEW);
        }
    }
    Ok(ExitCode::SUCCESS)
}
