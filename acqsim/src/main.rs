/*!
# Acquisition Simulator

Command-line front end for the acquisition pipeline model.

## Usage

### Simulated run (JSON report on stdout)
```bash
acqsim simulate --tier minimum --frames 10
acqsim simulate --rows 64 --cols 64 --frames 500 --mode continuous --loss 0.05
acqsim simulate --fault '{"kind":"sensor_stall","row":3,"persistence":"always"}'
```

### Loopback over a real UDP socket
```bash
acqsim udp --frames 100 --rows 128 --cols 128
```

### Golden link trace
```bash
acqsim trace --tier intermediate --rows 4 --cols 8
```

### Default configuration file
```bash
acqsim config --output acqsim.toml
```
*/

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use acqsim::config::AppConfig;
use acqsim::fault::FaultSpec;
use acqsim::pipeline::Pipeline;
use acqsim::source::TestPattern;
use acqsim::trace::golden_trace;
use acqsim::udp::UdpLoopback;
use shared::{ScanMode, Tier};

#[derive(Parser)]
#[command(name = "acqsim")]
#[command(about = "Tick-driven simulation of the sensor -> controller -> host acquisition pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults are used when it does not exist)
    #[arg(short, long, default_value = "acqsim.toml", global = true)]
    config: PathBuf,

    /// Log at DEBUG level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick-driven pipeline and print a JSON run report
    Simulate(RunArgs),

    /// Run the device chain and the endpoint over a loopback UDP socket
    Udp(RunArgs),

    /// Print the link byte stream of one test-pattern frame as hex
    Trace {
        #[arg(long, default_value = "minimum")]
        tier: Tier,

        #[arg(long)]
        rows: Option<usize>,

        #[arg(long)]
        cols: Option<usize>,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "acqsim.toml")]
        output: PathBuf,
    },
}

/// Overrides applied on top of the configuration file
#[derive(Args)]
struct RunArgs {
    /// minimum | intermediate | final
    #[arg(long)]
    tier: Option<Tier>,

    /// single | continuous | calibration
    #[arg(long)]
    mode: Option<ScanMode>,

    /// Frames to acquire (0 = until interrupted)
    #[arg(short, long)]
    frames: Option<u32>,

    #[arg(long)]
    rows: Option<usize>,

    #[arg(long)]
    cols: Option<usize>,

    /// Fragment payload size in bytes
    #[arg(long)]
    max_payload: Option<usize>,

    /// Probability of dropping a datagram
    #[arg(long)]
    loss: Option<f64>,

    /// Reordering window in datagrams
    #[arg(long)]
    reorder: Option<usize>,

    /// Probability of flipping one bit of a datagram
    #[arg(long)]
    corrupt: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Fault to inject, as JSON (repeatable)
    #[arg(long = "fault")]
    faults: Vec<String>,
}

#[derive(Serialize)]
struct Stamped<T: Serialize> {
    session: String,
    config: String,
    report: T,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the JSON report; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    match cli.command {
        Commands::Simulate(args) => run_simulation(&cli.config, args),
        Commands::Udp(args) => run_udp(&cli.config, args),
        Commands::Trace { tier, rows, cols } => print_trace(tier, rows, cols),
        Commands::Config { output } => generate_config_file(output),
    }
}

fn load_config(path: &Path, args: RunArgs) -> Result<AppConfig> {
    let mut config = if path.exists() {
        info!("Loading configuration from {}", path.display());
        AppConfig::load_from_file(path)?
    } else {
        AppConfig::new()
    };

    if let Some(tier) = args.tier {
        config.scan.tier = tier;
    }
    if let Some(mode) = args.mode {
        config.scan.mode = mode;
    }
    if let Some(frames) = args.frames {
        config.scan.frames = frames;
    }
    if args.rows.is_some() {
        config.scan.rows = args.rows;
    }
    if args.cols.is_some() {
        config.scan.cols = args.cols;
    }
    if let Some(max_payload) = args.max_payload {
        config.transport.max_payload = max_payload;
    }
    if let Some(loss) = args.loss {
        config.network.loss_rate = loss;
    }
    if let Some(reorder) = args.reorder {
        config.network.reorder_window = reorder;
    }
    if let Some(corrupt) = args.corrupt {
        config.network.corrupt_rate = corrupt;
    }
    if let Some(seed) = args.seed {
        config.network.seed = seed;
    }
    for fault in &args.faults {
        let spec: FaultSpec =
            serde_json::from_str(fault).with_context(|| format!("Invalid fault specification: {}", fault))?;
        config.faults.push(spec);
    }

    config.validate()?;
    Ok(config)
}

fn print_report<T: Serialize>(config_path: &Path, report: T) -> Result<()> {
    let stamped = Stamped {
        session: Local::now().to_rfc3339(),
        config: config_path.display().to_string(),
        report,
    };
    let json = serde_json::to_string_pretty(&stamped).context("Failed to serialize run report")?;
    println!("{}", json);
    Ok(())
}

/// Run the tick-driven pipeline
fn run_simulation(config_path: &Path, args: RunArgs) -> Result<()> {
    let config = load_config(config_path, args)?;
    let params = config.tier_params();
    info!(
        "Simulating {} frames of {}x{} ({:?}, {:?})",
        config.scan.frames, params.rows, params.cols, config.scan.tier, config.scan.mode
    );

    let mut pipeline = Pipeline::new(config.to_pipeline_config(), Box::new(TestPattern))?;
    pipeline.start(config.scan.frames)?;

    let mut mismatched = 0u64;
    let report = pipeline.run_with(config.scan.max_ticks, |outcome| {
        if let acqsim::FrameOutcome::Delivered(frame) = outcome {
            if frame.first_mismatch(&TestPattern::expected(frame.number, &params)).is_some() {
                mismatched += 1;
            }
        }
    });
    if mismatched > 0 {
        warn!("{} delivered frames differ from the test pattern", mismatched);
    }

    print_report(config_path, report)
}

/// Run the loopback UDP mode until done or Ctrl-C
fn run_udp(config_path: &Path, args: RunArgs) -> Result<()> {
    let config = load_config(config_path, args)?;
    let loopback = UdpLoopback::new(config.to_pipeline_config(), config.udp.clone())?;

    let running = loopback.running_flag();
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let report = loopback.run(config.scan.frames, config.scan.max_ticks)?;
    print_report(config_path, report)
}

fn print_trace(tier: Tier, rows: Option<usize>, cols: Option<usize>) -> Result<()> {
    let mut params = tier.params();
    params.rows = rows.unwrap_or(params.rows);
    params.cols = cols.unwrap_or(params.cols);

    let trace = golden_trace(params)?;
    for (i, line) in trace.chunks(32).enumerate() {
        println!("{:08x}  {}", i * 32, hex::encode(line));
    }
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    info!("Generated configuration file: {}", output_path.display());
    Ok(())
}
