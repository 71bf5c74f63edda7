//! CLI for lzmetrics
//!
//! Drives the metrics engine against the simulated platform:
//! - list: Show metric groups and their metrics
//! - query: Run an event-based query around an empty workload
//! - stream: Sample a time-based group with a streamer
//! - export: Capture query data and write the export envelope to a file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lzmetrics::{HardwareGeneration, MetricsConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "lzmetrics")]
#[command(about = "lzmetrics - GPU metric queries and streamers", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration (TOML); environment defaults otherwise
    #[arg(short, long, global = true, env = "LZ_METRICS_CONFIG")]
    config: Option<PathBuf>,

    /// Hardware generation of the simulated device
    #[arg(short, long, global = true, default_value = "gen12lp")]
    generation: HardwareGeneration,

    /// Number of subdevices of the simulated device
    #[arg(short, long, global = true, default_value = "0")]
    sub_devices: u32,

    /// Print engine telemetry (Prometheus text format) on exit
    #[arg(long, global = true)]
    telemetry: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List metric groups of every device
    List(commands::list::ListArgs),

    /// Collect one event-based query and calculate its values
    Query(commands::query::QueryArgs),

    /// Open a streamer on a time-based group and read reports
    Stream(commands::stream::StreamArgs),

    /// Write query data with its metric description to a file
    Export(commands::export::ExportArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => MetricsConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MetricsConfig::default(),
    };
    let session = commands::Session::start(cli.generation, cli.sub_devices, config)?;

    let result = match cli.command {
        Commands::List(args) => commands::list::run(&session, args),
        Commands::Query(args) => commands::query::run(&session, args),
        Commands::Stream(args) => commands::stream::run(&session, args),
        Commands::Export(args) => commands::export::run(&session, args),
    };

    if cli.telemetry {
        print!("{}", lzmetrics::telemetry::encode_metrics());
    }
    session.finish();
    result
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
