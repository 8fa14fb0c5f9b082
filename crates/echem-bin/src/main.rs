//! CLI entry point for echem
//!
//! Runs technique programs on the channels of a simulated potentiostat and
//! reports how each channel ended.
//!
//! # Usage
//!
//! Run a program file on its channels:
//! ```bash
//! echem run --program crates/echem-bin/programs/ocv_then_ca.toml --sync
//! ```
//!
//! Rest four channels at open circuit for ten seconds:
//! ```bash
//! echem ocv --time 10 --channels 0,1,2,3
//! ```
//!
//! Track the maximum power point of two cells for ten minutes, rescanning
//! every two minutes:
//! ```bash
//! echem mpp --run-time 600 --scan-interval 120 --channels 0,1
//! ```
//!
//! Logging follows `RUST_LOG` (default `info`). Engine settings come from
//! `--config` and `ECHEM_*` environment variables.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod export;
mod program;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use echem_core::{
    catalog, ChannelExecutor, Device, DeviceRegistry, EngineConfig, MeasurementRecord, Mpp, MppCycles, MppParams,
    Program, ProgramRunner, RunSummary, StopSignal,
};
use echem_driver_mock::{MockMode, MockPotentiostat};
use program::ProgramFile;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "echem")]
#[command(about = "Run electrochemistry technique programs on potentiostat channels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a TOML program file
    Run {
        /// Program file listing channels and techniques
        #[arg(long)]
        program: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Rest channels at open circuit
    Ocv {
        /// Rest time in seconds
        #[arg(long, default_value_t = 10.0)]
        time: f64,

        /// Seconds between readings
        #[arg(long, default_value_t = 1.0)]
        interval: f64,

        /// Channels to run
        #[arg(long, value_delimiter = ',', default_value = "0")]
        channels: Vec<u8>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Scan each channel, then track its maximum power point
    Mpp {
        /// Tracking time in seconds
        #[arg(long, default_value_t = 60.0)]
        run_time: f64,

        /// Repeat the scan every this many seconds of tracking
        #[arg(long)]
        scan_interval: Option<f64>,

        /// Channels to run
        #[arg(long, value_delimiter = ',', default_value = "0")]
        channels: Vec<u8>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// List the known instrument models
    Models,
}

#[derive(Args)]
struct RunArgs {
    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hold every channel until all of them started
    #[arg(long)]
    sync: bool,

    /// Simulated instrument model
    #[arg(long, default_value = "VMP3")]
    model: String,

    /// Simulator behaviour
    #[arg(long, value_enum, default_value_t = Mode::Instant)]
    mode: Mode,

    /// Seed for simulated noise and failures
    #[arg(long)]
    seed: Option<u64>,

    /// Instrument address
    #[arg(long, default_value = "10.0.0.1")]
    address: String,

    /// Write every record to this CSV file
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Instant,
    Realistic,
    Chaos,
}

impl From<Mode> for MockMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Instant => MockMode::Instant,
            Mode::Realistic => MockMode::Realistic,
            Mode::Chaos => MockMode::Chaos,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { program, run } => {
            let program = ProgramFile::load(&program)?;
            execute(program, run).await
        }
        Commands::Ocv {
            time,
            interval,
            channels,
            run,
        } => execute(ProgramFile::ocv(channels, time, interval)?, run).await,
        Commands::Mpp {
            run_time,
            scan_interval,
            channels,
            run,
        } => track(run_time, scan_interval, channels, run).await,
        Commands::Models => {
            for device in catalog::DEVICES {
                println!("{:>3}  {:<10} {}", device.code, device.name, device.family);
            }
            Ok(())
        }
    }
}

/// Engine settings and the simulated instrument selected by `args`.
fn setup(args: &RunArgs) -> Result<(EngineConfig, Arc<Device>)> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    config.sync |= args.sync;

    let mut builder = MockPotentiostat::builder().model(&args.model)?.mode(args.mode.into());
    if let Some(seed) = args.seed {
        builder = builder.seed(seed);
    }
    let registry = DeviceRegistry::new();
    let device = registry.device(&args.address, Arc::new(builder.build()));
    Ok((config, device))
}

fn interrupt(stop: StopSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping channels");
            stop.trigger();
        }
    });
}

async fn execute(program: ProgramFile, args: RunArgs) -> Result<()> {
    let (config, device) = setup(&args)?;

    let mut runner = ProgramRunner::new(&config);
    for &channel in &program.channels {
        let mut executor = ChannelExecutor::from_techniques(device.clone(), channel, &program.techniques, config.clone())
            .with_context(|| format!("preparing channel {channel}"))?;
        executor.on_data(Arc::new(|channel: u8, records: &[MeasurementRecord]| {
            if let Some(last) = records.last() {
                info!(channel, rows = records.len(), elapsed = last.elapsed, voltage = ?last.voltage, current = ?last.current, "Data");
            }
        }));
        runner.add(executor)?;
    }

    interrupt(runner.stop_signal());
    runner.start()?;
    let summary = runner.wait().await;
    report(&summary);

    if let Some(path) = &args.output {
        let channels = runner.executors().map(|e| (e.channel(), e.records()));
        let rows = export::write_file(path, channels)?;
        info!(path = %path.display(), rows, "Records written");
    }

    let failed = summary.failed().count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} channels failed", summary.outcomes.len());
    }
    Ok(())
}

/// Outcome of one MPP channel.
struct Tracked {
    channel: u8,
    result: echem_core::Result<()>,
    voc: Option<f64>,
    voltage: Option<f64>,
    records: Vec<MeasurementRecord>,
}

impl Tracked {
    fn from_mpp(mpp: &Mpp, result: echem_core::Result<()>) -> Self {
        Self {
            channel: mpp.channel(),
            result,
            voc: mpp.voc(),
            voltage: mpp.tracker().map(|t| t.voltage()),
            records: mpp.records(),
        }
    }
}

async fn track(run_time: f64, scan_interval: Option<f64>, channels: Vec<u8>, args: RunArgs) -> Result<()> {
    let (config, device) = setup(&args)?;
    let stop = StopSignal::new();
    interrupt(stop.clone());

    let mut tasks = tokio::task::JoinSet::new();
    for channel in channels {
        let params = MppParams::new(run_time);
        let stop = stop.clone();
        match scan_interval {
            Some(interval) => {
                let mut cycles = MppCycles::new(device.clone(), channel, params, interval, config.clone())
                    .with_context(|| format!("preparing channel {channel}"))?
                    .with_stop_signal(stop);
                tasks.spawn(async move {
                    let result = cycles.run().await;
                    let last = cycles.cycles().last();
                    Tracked {
                        channel,
                        result,
                        voc: last.and_then(Mpp::voc),
                        voltage: last.and_then(Mpp::tracker).map(|t| t.voltage()),
                        records: cycles.cycles().iter().flat_map(Mpp::records).collect(),
                    }
                });
            }
            None => {
                let mut mpp = Mpp::new(device.clone(), channel, params, config.clone())
                    .with_context(|| format!("preparing channel {channel}"))?
                    .with_stop_signal(stop);
                tasks.spawn(async move {
                    let result = mpp.run().await;
                    Tracked::from_mpp(&mpp, result)
                });
            }
        }
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(joined.context("MPP task failed")?);
    }
    outcomes.sort_by_key(|t| t.channel);

    println!();
    for outcome in &outcomes {
        let voc = outcome.voc.map_or("-".to_string(), |v| format!("{v:.4} V"));
        let held = outcome.voltage.map_or("-".to_string(), |v| format!("{v:.4} V"));
        match &outcome.result {
            Ok(()) => println!("channel {}: voc {voc}, tracked to {held}", outcome.channel),
            Err(err) => println!("channel {}: failed: {err}", outcome.channel),
        }
    }

    if let Some(path) = &args.output {
        let channels = outcomes.iter().map(|t| (t.channel, &t.records[..]));
        let rows = export::write_file(path, channels)?;
        info!(path = %path.display(), rows, "Records written");
    }

    let failed = outcomes.iter().filter(|t| t.result.is_err()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} channels failed", outcomes.len());
    }
    Ok(())
}

fn report(summary: &RunSummary) {
    println!();
    for outcome in &summary.outcomes {
        println!("{outcome}");
    }
    println!("{} records in total", summary.total_records());
}
