//! Insider-Harvest main entry point
//!
//! This is the command-line interface for the insider-trading filings harvester.

use anyhow::Context;
use clap::{Parser, Subcommand};
use insider_harvest::config::{load_settings, ConfigLayers, LoadedSettings, Settings};
use insider_harvest::output::{load_statistics, print_run_report, print_statistics};
use insider_harvest::storage::SqliteStorage;
use insider_harvest::{Coordinator, Scheduler};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Insider-Harvest: a resilient insider-trading filings harvester
///
/// Insider-Harvest fetches the filings tables of the configured source pages,
/// normalizes each row into a trade record and keeps a deduplicated, revisioned
/// store of them. It tolerates throttling, bot challenges and markup drift.
#[derive(Parser, Debug)]
#[command(name = "insider-harvest")]
#[command(version)]
#[command(about = "A resilient insider-trading filings harvester", long_about = None)]
struct Cli {
    /// Environment overlay to apply (e.g. "production")
    #[arg(long, global = true, env = "INSIDER_HARVEST_ENV")]
    env: Option<String>,

    /// Explicit configuration file, applied after all other layers
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory holding default.toml and environment overlays
    #[arg(long, global = true, value_name = "DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one full-refresh pass, then exit
    Full {
        /// Restrict the run to these sources
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
    },

    /// Poll continuously until interrupted
    Monitor {
        /// Seconds between change-detection polls
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,

        /// Seconds between full refreshes
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        full_refresh_interval: Option<u64>,
    },

    /// Run one change-detection pass, then exit
    Check {
        /// Restrict the run to these sources
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
    },

    /// Print store statistics
    DbHealth,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let layers = ConfigLayers::new(&cli.config_dir)
        .with_env(cli.env.clone())
        .with_explicit(cli.config.clone());
    let loaded = load_settings(&layers).context("Failed to load configuration")?;
    log_loaded(&loaded);

    let mut settings = loaded.settings;

    match cli.command {
        Command::Full { sources } => handle_full(settings, &sources).await,
        Command::Check { sources } => handle_check(settings, &sources).await,
        Command::Monitor {
            interval,
            full_refresh_interval,
        } => {
            if let Some(secs) = interval {
                settings.monitoring.change_detection_interval = secs;
            }
            if let Some(secs) = full_refresh_interval {
                settings.monitoring.full_refresh_interval = secs;
            }
            handle_monitor(settings).await
        }
        Command::DbHealth => handle_db_health(&settings),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
///
/// `RUST_LOG`, when set, takes precedence over the flags.
fn setup_logging(verbose: u8, quiet: bool) {
    let default = if quiet {
        "error"
    } else {
        match verbose {
            0 => "insider_harvest=info,warn",
            1 => "insider_harvest=debug,info",
            2 => "insider_harvest=trace,debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn log_loaded(loaded: &LoadedSettings) {
    if loaded.layers.is_empty() {
        tracing::info!("No configuration files found, using built-in defaults");
    }
    for layer in &loaded.layers {
        tracing::info!("Configuration layer: {}", layer.display());
    }
    tracing::info!("Configuration loaded successfully (hash: {})", loaded.fingerprint);
}

/// Builds a coordinator whose token is cancelled on Ctrl-C
fn build_coordinator(settings: Settings) -> anyhow::Result<Arc<Coordinator>> {
    let cancel = CancellationToken::new();
    let coordinator =
        Coordinator::new(Arc::new(settings), cancel.clone()).context("Startup failed")?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight jobs");
            cancel.cancel();
        }
    });

    Ok(Arc::new(coordinator))
}

/// Handles the `full` command: one full-refresh pass
async fn handle_full(settings: Settings, sources: &[String]) -> anyhow::Result<u8> {
    let coordinator = build_coordinator(settings)?;
    let report = coordinator
        .run_full(sources)
        .await
        .context("Full refresh failed")?;

    print_run_report(&report);
    Ok(report.exit_code())
}

/// Handles the `check` command: one change-detection pass
async fn handle_check(settings: Settings, sources: &[String]) -> anyhow::Result<u8> {
    let coordinator = build_coordinator(settings)?;
    let report = coordinator
        .run_check(sources)
        .await
        .context("Change detection failed")?;

    print_run_report(&report);
    Ok(report.exit_code())
}

/// Handles the `monitor` command: passes on both cadences until Ctrl-C
async fn handle_monitor(settings: Settings) -> anyhow::Result<u8> {
    let coordinator = build_coordinator(settings)?;

    let passes = Scheduler::from_settings(coordinator)
        .run()
        .await
        .context("Monitor stopped on a fatal error")?;

    tracing::info!("Monitor finished after {} passes", passes);
    Ok(0)
}

/// Handles the `db-health` command: prints statistics from the database
fn handle_db_health(settings: &Settings) -> anyhow::Result<u8> {
    println!("Database: {}\n", settings.database.path);

    let storage = SqliteStorage::open(Path::new(&settings.database.path))
        .context("Failed to open database")?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    Ok(0)
}
