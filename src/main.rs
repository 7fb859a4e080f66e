//! contend CLI - covert timing channel over cache and memory-bandwidth contention.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use contend::models::{
    ModulationStrategy, RendezvousStrategy, SensingStrategy, SlotMode, parse_bits,
};
use contend::{
    BitErrorReport, Calibrator, Config, Modulator, ProbeStrategy, RecoveredMessage, Sensor,
    StressStrategy, SystemClock,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "contend")]
#[command(version)]
#[command(about = "Covert timing channel over shared cache and memory-bandwidth contention")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults are used if omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Slot duration in milliseconds
    #[arg(long, global = true)]
    slot_ms: Option<u64>,

    /// Repetition factor (odd)
    #[arg(long, global = true)]
    repetition: Option<usize>,

    /// Rendezvous strategy
    #[arg(long, global = true, value_enum)]
    rendezvous: Option<RendezvousArg>,

    /// Start-time artifact location
    #[arg(long, global = true)]
    artifact: Option<PathBuf>,

    /// Launch all slot actions on schedule and gather at the end
    #[arg(long, global = true)]
    gather: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a bitstring
    Transmit {
        /// Bits to send, e.g. 10110010
        #[arg(short, long)]
        binary: String,

        /// Contention primitive
        #[arg(long, value_enum)]
        modulation: Option<ModulationArg>,
    },

    /// Receive a bitstring
    Receive {
        /// Number of logical bits to receive
        #[arg(short, long)]
        bits: Option<usize>,

        /// Decision threshold; skips calibration
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Sensing primitive
        #[arg(long, value_enum)]
        sensing: Option<SensingArg>,

        /// Write per-slot records as JSONL
        #[arg(long)]
        records: Option<PathBuf>,

        /// Transmitted bits, to report the bit error rate
        #[arg(long)]
        expect: Option<String>,
    },

    /// Measure the idle-channel baseline and derived threshold
    Calibrate {
        /// Sensing primitive
        #[arg(long, value_enum)]
        sensing: Option<SensingArg>,
    },

    /// Compare transmitted and received bitstrings
    Compare {
        /// Transmitted bits
        #[arg(short, long)]
        sent: String,

        /// Received symbols (0, 1, x)
        #[arg(short, long)]
        received: String,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Clone, Copy, ValueEnum)]
enum RendezvousArg {
    Artifact,
    Quantized,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModulationArg {
    Workload,
    Cache,
}

#[derive(Clone, Copy, ValueEnum)]
enum SensingArg {
    Bandwidth,
    Cache,
}

impl From<SensingArg> for SensingStrategy {
    fn from(arg: SensingArg) -> Self {
        match arg {
            SensingArg::Bandwidth => Self::Bandwidth,
            SensingArg::Cache => Self::Cache,
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# contend configuration file
# Both roles must agree on [channel] and [rendezvous].

[channel]
slot_ms = 1000
bits = 16
repetition = 1            # odd; 3 enables majority voting
guard_fraction = 0.01     # wake this far into each slot
trailing_guard_fraction = 0.05
mode = "blocking"         # or "gather"
max_in_flight = 1024
clock = "monotonic"       # or "wall" for quantized rendezvous across hosts

[rendezvous]
strategy = "artifact"     # or "quantized"
path = "/tmp/covert_start"
lead_ms = 2000
poll_interval_ms = 50
quantum_secs = 60
# timeout_secs = 300

[sensing]
strategy = "bandwidth"    # or "cache"
# threshold = 9000.0      # skips calibration
calibration_ms = 2000
# factor = 0.9            # default 0.9 bandwidth, 1.1 cache
warmup_ms = 0

[modulation]
strategy = "workload"     # or "cache"
preroll_ms = 0

[workload]
program = "./simple_stream"
args = []
marker = "Copy:"
pool_size = 2

[cache]
ways = 12
stride = 2097152
flush_interval_ms = 500
probe_accesses = 100000
probe_scale = 10
# threshold_cycles = 2000.0
"#;
    println!("{example}");
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    if let Some(slot_ms) = cli.slot_ms {
        config.channel.slot_ms = slot_ms;
    }
    if let Some(r) = cli.repetition {
        config.channel.repetition = r;
    }
    if let Some(strategy) = cli.rendezvous {
        config.rendezvous.strategy = match strategy {
            RendezvousArg::Artifact => RendezvousStrategy::Artifact,
            RendezvousArg::Quantized => RendezvousStrategy::Quantized,
        };
    }
    if let Some(path) = &cli.artifact {
        config.rendezvous.path = path.clone();
    }
    if cli.gather {
        config.channel.mode = SlotMode::Gather;
    }
    Ok(config)
}

fn print_bit_errors(report: &BitErrorReport) {
    println!("\n=== Bit Error Report ===");
    if report.truncated {
        println!("Warning:     lengths differ, compared first {}", report.total);
    }
    println!("Total:       {}", report.total);
    println!("Correct:     {}", report.correct);
    println!("Errors:      {}", report.errors);
    println!("Erasures:    {}", report.erasures);
    println!("Accuracy:    {:.2}%", report.accuracy_percent());
    println!("Error rate:  {:.2}%", report.error_rate_percent());
    println!("{}", report.positions_line());
    println!("{}", report.preview());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match &cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli)?;
            config.validate().context("Invalid configuration")?;

            info!("Configuration is valid");
            info!(
                "  Channel: {} bits × R={} over {} ms slots ({:?})",
                config.channel.bits,
                config.channel.repetition,
                config.channel.slot_ms,
                config.channel.mode
            );
            info!("  Rendezvous: {:?}", config.rendezvous.strategy);
            info!(
                "  Modulation: {:?}, sensing: {:?} (factor {})",
                config.modulation.strategy,
                config.sensing.strategy,
                config.sensing.effective_factor()
            );
            return Ok(());
        }

        Commands::Compare { sent, received } => {
            let sent = parse_bits(sent).context("Invalid transmitted bits")?;
            let received = RecoveredMessage::parse(received).context("Invalid received symbols")?;
            print_bit_errors(&BitErrorReport::compare(&sent, &received));
        }

        Commands::Transmit { binary, modulation } => {
            let mut config = load_config(&cli)?;
            if let Some(m) = modulation {
                config.modulation.strategy = match m {
                    ModulationArg::Workload => ModulationStrategy::Workload,
                    ModulationArg::Cache => ModulationStrategy::Cache,
                };
            }
            config.validate().context("Invalid configuration")?;
            let bits = parse_bits(binary).context("Invalid bitstring")?;

            let clock = SystemClock::new(config.channel.clock).context("Clock unavailable")?;
            let stressor =
                StressStrategy::from_config(&config).context("Failed to set up modulation")?;
            let modulator = Modulator::from_config(clock, stressor, &config)?;
            let report = modulator.transmit(&bits).await?;

            println!("\n=== Transmission Complete ===");
            println!("Bits:        {}", bits.len());
            println!("Raw slots:   {}", report.total_slots);
            println!("Contended:   {}", report.contended);
            println!("Idle:        {}", report.idle);
            println!("Missed:      {}", report.missed);
            println!("Failed:      {}", report.failed);
            println!("Launches:    {}", report.launches);
            println!("Runtime:     {:.1}s", report.runtime_secs);
        }

        Commands::Receive {
            bits,
            threshold,
            sensing,
            records,
            expect,
        } => {
            let mut config = load_config(&cli)?;
            if let Some(n) = bits {
                config.channel.bits = *n;
            }
            if let Some(t) = threshold {
                config.sensing.threshold = Some(*t);
            }
            if let Some(s) = sensing {
                config.sensing.strategy = (*s).into();
            }
            let expected = expect
                .as_deref()
                .map(parse_bits)
                .transpose()
                .context("Invalid expected bits")?;
            if let (Some(sent), None) = (&expected, bits) {
                config.channel.bits = sent.len();
            }
            config.validate().context("Invalid configuration")?;

            let clock = SystemClock::new(config.channel.clock).context("Clock unavailable")?;
            let probe = ProbeStrategy::from_config(&config).context("Failed to set up sensing")?;
            let sensor = Sensor::from_config(clock, probe, &config)?
                .with_records(records.clone())
                .with_progress(true);
            let report = sensor.run().await?;

            println!("\n=== Reception Complete ===");
            match report.baseline {
                Some(b) => println!("Baseline:    {b:.2}"),
                None => println!("Baseline:    (threshold supplied)"),
            }
            println!("Threshold:   {:.2}", report.threshold);
            println!("Raw slots:   {}", report.total_slots);
            println!("Missed:      {}", report.missed);
            println!("Failed:      {}", report.failed);
            println!("No sample:   {}", report.empty);
            println!("Runtime:     {:.1}s", report.runtime_secs);
            println!("Message:     {}", report.message);
            if let Some(path) = records {
                println!("Records:     {path:?}");
            }

            if let Some(sent) = expected {
                print_bit_errors(&BitErrorReport::compare(&sent, &report.message));
            }
        }

        Commands::Calibrate { sensing } => {
            let mut config = load_config(&cli)?;
            if let Some(s) = sensing {
                config.sensing.strategy = (*s).into();
            }
            config.validate().context("Invalid configuration")?;

            let probe = ProbeStrategy::from_config(&config).context("Failed to set up sensing")?;
            let calibrator = Calibrator::new(
                Duration::from_millis(config.sensing.calibration_ms),
                config.sensing.effective_factor(),
            );
            let calibration = calibrator.calibrate(&probe).await?;

            println!("\n=== Calibration Complete ===");
            println!("Strategy:    {:?}", config.sensing.strategy);
            if let Some(b) = calibration.baseline {
                println!("Baseline:    {b:.2}");
            }
            println!("Factor:      {}", config.sensing.effective_factor());
            println!("Threshold:   {:.2}", calibration.threshold.value);
            println!("Polarity:    {:?}", calibration.threshold.polarity);
        }
    }

    Ok(())
}
