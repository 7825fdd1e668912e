//! Command-line entry point for the riptide pipeline.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use riptide_core::{StrategyDescriptor, VoltageTable};
use riptide_runtime::pipeline::{self, PipelineConfig};
use riptide_runtime::{PipelineError, SocketSource};

/// Exit status for a run that could not keep up with the feed.
const EXIT_BOTTLENECK: u8 = 10;

#[derive(Parser)]
#[command(name = "riptide")]
#[command(version = "0.1.0")]
#[command(about = "Elastic sliding-window pipeline over a TCP quote feed", long_about = None)]
struct Cli {
    /// Number of distinct stock keys in the feed
    num_keys: usize,

    /// Initial number of window workers
    num_workers: usize,

    /// TCP port to accept the feed on
    port: u16,

    /// Window size in tuples
    window_size: usize,

    /// Window slide in tuples
    window_slide: usize,

    /// Strategy configuration file (key = value)
    strategy_config: PathBuf,

    /// Write per-step statistics to this file
    #[arg(long)]
    stats_path: Option<PathBuf>,

    /// Out-of-order result slots per key before failing
    #[arg(long)]
    reorder_slots: Option<usize>,

    /// Capacity of the data queues between stages
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Voltage table for the energy-aware strategy (cores;frequency;voltage)
    #[arg(long)]
    voltage_table: Option<PathBuf>,

    /// Upper bound on worker count (default: 4x the initial count)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Pin stages to cores; fails if the host has too few
    #[arg(long)]
    pin_cores: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::Bottleneck { .. }) => ExitCode::from(EXIT_BOTTLENECK),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let descriptor = StrategyDescriptor::from_file(&cli.strategy_config)
        .with_context(|| format!("loading {}", cli.strategy_config.display()))?;
    let voltage_table = match &cli.voltage_table {
        Some(path) => VoltageTable::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VoltageTable::default(),
    };

    let mut cfg = PipelineConfig::new(
        cli.num_keys,
        cli.num_workers,
        cli.window_size,
        cli.window_slide,
        descriptor,
    );
    if let Some(max) = cli.max_workers {
        cfg.max_workers = max;
    }
    if let Some(slots) = cli.reorder_slots {
        cfg.reorder_slots = slots;
    }
    if let Some(cap) = cli.queue_capacity {
        cfg.queue_capacity = cap;
    }
    cfg.stats_path = cli.stats_path.clone();
    cfg.voltage_table = voltage_table;
    cfg.pin_cores = cli.pin_cores;

    info!(
        keys = cli.num_keys,
        workers = cli.num_workers,
        window = cli.window_size,
        slide = cli.window_slide,
        strategy = %cfg.descriptor.kind,
        "starting pipeline"
    );
    let source = SocketSource::bind(cli.port)?;
    let outcome = pipeline::run(cfg, source)?;
    info!(
        tuples = outcome.summary.tuples,
        results = outcome.results,
        elapsed_ms = outcome.summary.elapsed_ms,
        "run finished"
    );
    Ok(())
}
