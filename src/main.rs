//! CLI Entry Point for bench_daq
//!
//! One subcommand per bench routine. Every instrument is looked up in the
//! bench configuration (`--config`, default `config/bench.toml`); `--simulate`
//! swaps every transport for a simulated instrument so a routine can be
//! rehearsed without hardware.
//!
//! # Usage
//!
//! ```bash
//! bench_daq list
//! bench_daq psu --channel 1 --volts 3.3 --amps 0.1 --seconds 10
//! bench_daq sweep --table sweep.csv --output data/sweep.csv
//! bench_daq generate --shape sine --frequency 1000 --amplitude-mv 100 --seconds 30
//! bench_daq --simulate sync --cycles 20 --bursts 3
//! bench_daq transfer --input in.wav --output out.wav --method welch
//! ```

use anyhow::{bail, Context, Result};
use bench_daq::analysis::arb;
use bench_daq::analysis::gain::{GainBandwidthProduct, OpenLoopGain};
use bench_daq::analysis::transfer_function::{Method, TransferFunctionAnalyzer, Window, DEFAULT_SAMPLE_RATE};
use bench_daq::config::{duration_from_secs, BenchConfig, DEFAULT_CONFIG_PATH};
use bench_daq::data::storage;
use bench_daq::hardware::noise_analyzer::{InputBandwidth, NoiseSetup};
use bench_daq::hardware::signal_generator::{WaveformSettings, WaveformShape};
use bench_daq::hardware::InstrumentRegistry;
use bench_daq::logging::{self, parse_log_level, OutputFormat, TracingConfig};
use bench_daq::procedures::countdown::{CancelHandle, CancelToken, DEFAULT_TICK};
use bench_daq::procedures::dual_channel::{run_dual_channel, run_signal_and_clock, DualChannelRequest, PhaseMode};
use bench_daq::procedures::generator_sync::{BurstSettings, DualGeneratorSync, DEFAULT_PHASE_OFFSET_DEG};
use bench_daq::procedures::noise::{measure_noise, write_noise_csv, DEFAULT_CUTOFF_HZ};
use bench_daq::procedures::scope_capture::{capture_to_csv, ScopeCaptureRequest, Stimulus, DEFAULT_CAPTURE_POINTS};
use bench_daq::procedures::sweep::{self, run_list_sweep, run_stepped_sweep, SweepTable};
use bench_daq::procedures::timed_output::{hold_smu_output, hold_supply_output, SmuOutput, SupplyOutput};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bench_daq")]
#[command(about = "Bench automation for ASIC and amplifier validation", long_about = None)]
struct Cli {
    /// Bench configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated instruments instead of real transports
    #[arg(long, global = true)]
    simulate: bool,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify every configured instrument and list visible resources
    List,

    /// Hold a fixed supply output for a time, then switch it off
    Psu {
        /// Instrument id (default: first power supply)
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value_t = 1)]
        channel: u8,
        #[arg(long)]
        volts: f64,
        #[arg(long)]
        amps: f64,
        #[arg(long)]
        seconds: f64,
    },

    /// Host-timed voltage sweep, measuring at every step
    Sweep(SweepArgs),

    /// Supply list-mode sweep recorded by the internal data log
    ListSweep {
        #[command(flatten)]
        sweep: SweepArgs,
        /// Data log period in seconds (minimum 0.2)
        #[arg(long, default_value_t = 0.2)]
        period: f64,
    },

    /// Source a voltage from the SMU for a time, then switch it off
    Smu {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        volts: f64,
        /// Current compliance in µA
        #[arg(long)]
        compliance_ua: f64,
        #[arg(long)]
        seconds: f64,
    },

    /// Drive both channels of a generator, optionally with a clock generator
    Generate(GenerateArgs),

    /// Fire synchronized bursts from a primary and a secondary generator
    Sync(SyncArgs),

    /// Capture a scope channel to CSV
    Scope(ScopeArgs),

    /// Write a normalized triangle waveform, optionally loading it
    Arb {
        #[arg(long, default_value_t = arb::DEFAULT_ARB_POINTS)]
        points: usize,
        #[arg(long, default_value = "arb_waveform.csv")]
        output: PathBuf,
        /// Load the waveform into this generator and switch its output on
        #[arg(long)]
        load: Option<String>,
        #[arg(long, default_value_t = 2000.0)]
        frequency: f64,
        #[arg(long, default_value_t = 50.0)]
        amplitude_mv: f64,
    },

    /// Estimate a transfer function from recorded input and output signals
    Transfer(TransferArgs),

    /// Open-loop gain and gain-bandwidth product from an input,output CSV
    Gain {
        /// Two-column CSV: input, output
        #[arg(long)]
        signals: PathBuf,
        /// One-column CSV of frequencies; linspace(1, 1000, n) otherwise
        #[arg(long)]
        frequencies: Option<PathBuf>,
    },

    /// Measure input-referred noise density with the analyzer
    Noise {
        /// Keep points strictly below this frequency
        #[arg(long, default_value_t = DEFAULT_CUTOFF_HZ)]
        cutoff: f64,
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,
        #[arg(long, default_value_t = 10)]
        averages: u32,
        /// Analyzer input band: 20k, 40k or 90k
        #[arg(long, default_value = "20k")]
        bandwidth: String,
        #[arg(long, default_value = "Sensor")]
        channel_name: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SweepArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long, default_value_t = 1)]
    channel: u8,
    /// CSV with voltage,current,dwell[,bost,eost] columns
    #[arg(long)]
    table: PathBuf,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct WaveArgs {
    /// sine, square, ramp, pulse, noise, dc
    #[arg(long, default_value = "sine")]
    shape: WaveformShape,
    #[arg(long, default_value_t = 1000.0)]
    frequency: f64,
    #[arg(long, default_value_t = 100.0)]
    amplitude_mv: f64,
    #[arg(long, default_value_t = 0.0)]
    offset_mv: f64,
}

impl WaveArgs {
    fn settings(&self) -> WaveformSettings {
        WaveformSettings::new(self.shape, self.frequency, self.amplitude_mv, self.offset_mv)
    }
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long)]
    id: Option<String>,
    #[command(flatten)]
    wave: WaveArgs,
    /// complementary (0/180) or in_phase (0/0)
    #[arg(long, default_value = "complementary")]
    phase: PhaseMode,
    #[arg(long)]
    seconds: f64,
    /// Also drive a square-wave clock from this generator
    #[arg(long)]
    clock: Option<String>,
    #[arg(long, default_value_t = 10_000.0)]
    clock_frequency: f64,
    #[arg(long, default_value_t = 1000.0)]
    clock_amplitude_mv: f64,
    #[arg(long, default_value_t = 0.0)]
    clock_offset_mv: f64,
    #[arg(long, default_value = "complementary")]
    clock_phase: PhaseMode,
}

#[derive(Args)]
struct SyncArgs {
    #[arg(long)]
    primary: Option<String>,
    #[arg(long)]
    secondary: Option<String>,
    #[command(flatten)]
    wave: WaveArgs,
    /// Primary phase in degrees
    #[arg(long, default_value_t = 0.0)]
    phase: f64,
    /// Secondary phase relative to the primary, degrees
    #[arg(long, default_value_t = DEFAULT_PHASE_OFFSET_DEG)]
    phase_offset: f64,
    /// Cycles per burst; infinite when omitted
    #[arg(long)]
    cycles: Option<u32>,
    #[arg(long, default_value_t = 1)]
    bursts: u32,
}

#[derive(Args)]
struct ScopeArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long, default_value_t = 1)]
    channel: u8,
    #[arg(long, default_value_t = DEFAULT_CAPTURE_POINTS)]
    points: usize,
    /// Drive a 2 kHz / 50 mV stimulus from this generator during the capture
    #[arg(long)]
    stimulus: Option<String>,
    /// Play this arbitrary waveform instead of the sine, if the file exists
    #[arg(long)]
    arb_file: Option<PathBuf>,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    comments: Option<String>,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct TransferArgs {
    /// Input signal: WAV file, or a two-column input,output CSV
    #[arg(long)]
    input: PathBuf,
    /// Output signal WAV file (omit for a two-column CSV input)
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, default_value = "welch")]
    method: Method,
    #[arg(long, default_value = "hann")]
    window: Window,
    /// Welch segment length; n/8 when omitted
    #[arg(long)]
    nperseg: Option<usize>,
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: f64,
    /// Filter this one-column signal through the estimate
    #[arg(long)]
    apply: Option<PathBuf>,
    /// Result CSV; timestamped in the output directory otherwise
    #[arg(long)]
    save: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&config, cli.log_level.as_deref(), cli.log_format.as_deref())?;
    tracing::debug!(config = %cli.config.display(), simulate = cli.simulate, "starting");

    let registry = InstrumentRegistry::new(config, cli.simulate);
    let cancel = CancelHandle::new();
    let _ctrl_c = cancel.cancel_on_ctrl_c();
    let token = cancel.token();

    match cli.command {
        Commands::List => list(&registry).await,
        Commands::Psu {
            id,
            channel,
            volts,
            amps,
            seconds,
        } => {
            let request = SupplyOutput {
                channel,
                volts: positive("voltage", volts)?,
                amps: positive("current", amps)?,
                duration: seconds_arg(seconds)?,
            };
            let psu = registry.power_supply(id.as_deref()).await?;
            println!("🔌 {} channel {channel}: {volts} V / {amps} A for {seconds} s", psu.scpi().id());
            hold_supply_output(&psu, &request, DEFAULT_TICK, &token, print_remaining).await?;
            println!("✅ Output off");
            Ok(())
        }
        Commands::Sweep(args) => stepped_sweep(&registry, args, &token).await,
        Commands::ListSweep { sweep, period } => list_sweep(&registry, sweep, period, &token).await,
        Commands::Smu {
            id,
            volts,
            compliance_ua,
            seconds,
        } => {
            let request = SmuOutput {
                volts: positive("voltage", volts)?,
                compliance_a: positive("compliance", compliance_ua)? * 1e-6,
                duration: seconds_arg(seconds)?,
            };
            let smu = registry.smu(id.as_deref()).await?;
            println!("🔌 {}: {volts} V, compliance {compliance_ua} µA for {seconds} s", smu.scpi().id());
            hold_smu_output(&smu, &request, DEFAULT_TICK, &token, print_remaining).await?;
            println!("✅ Output off");
            Ok(())
        }
        Commands::Generate(args) => generate(&registry, args, &token).await,
        Commands::Sync(args) => sync(&registry, args, &token).await,
        Commands::Scope(args) => scope(&registry, args).await,
        Commands::Arb {
            points,
            output,
            load,
            frequency,
            amplitude_mv,
        } => {
            let wave = arb::triangle(points)?;
            storage::write_single_column(&output, &wave)?;
            println!("💾 {points}-point triangle written to {}", output.display());
            if let Some(id) = load {
                let generator = registry.signal_generator(Some(id.as_str())).await?;
                generator
                    .load_arbitrary(&wave, positive("amplitude", amplitude_mv)?, positive("frequency", frequency)?)
                    .await?;
                generator.set_channel_output(1, true).await?;
                println!("📡 Loaded into {id}, output on");
            }
            Ok(())
        }
        Commands::Transfer(args) => transfer(registry.config(), args),
        Commands::Gain { signals, frequencies } => gain(&signals, frequencies.as_deref()),
        Commands::Noise {
            cutoff,
            seconds,
            averages,
            bandwidth,
            channel_name,
            output,
        } => {
            let setup = NoiseSetup {
                channel_name,
                acquisition_seconds: positive("acquisition time", seconds)?,
                averages,
                bandwidth: parse_bandwidth(&bandwidth)?,
                ..NoiseSetup::default()
            };
            let analyzer = registry.noise_analyzer()?;
            println!("🎧 Measuring noise for {seconds} s ({averages} averages)...");
            let spectrum = measure_noise(
                &*analyzer,
                &setup,
                positive("cutoff", cutoff)?,
                registry.config().timing.analyzer_poll(),
                &token,
            )
            .await?;
            let path = output.unwrap_or_else(|| {
                storage::timestamped_path(&registry.config().storage.output_dir, "noise", "csv")
            });
            write_noise_csv(&path, &spectrum)?;
            println!("💾 {} points below {cutoff} Hz saved to {}", spectrum.len(), path.display());
            Ok(())
        }
    }
}

fn init_logging(config: &BenchConfig, level: Option<&str>, format: Option<&str>) -> Result<()> {
    let mut tracing_config = TracingConfig::from_bench_config(config)?;
    if let Some(level) = level {
        tracing_config.level = parse_log_level(level)?;
    }
    if let Some(format) = format {
        tracing_config = tracing_config.with_format(format.parse::<OutputFormat>()?);
    }
    logging::init(tracing_config)?;
    Ok(())
}

fn positive(name: &str, value: f64) -> Result<f64> {
    if !(value.is_finite() && value > 0.0) {
        bail!("{name} must be a positive number, got {value}");
    }
    Ok(value)
}

fn seconds_arg(seconds: f64) -> Result<Duration> {
    Ok(duration_from_secs("duration", seconds)?)
}

fn print_remaining(remaining: Duration) {
    println!("⏱️  {} s remaining", remaining.as_secs_f64().ceil());
}

fn parse_bandwidth(raw: &str) -> Result<InputBandwidth> {
    Ok(match raw.trim().to_lowercase().as_str() {
        "20k" | "20" => InputBandwidth::Bw20k44kHz,
        "40k" | "40" => InputBandwidth::Bw40k96kHz,
        "90k" | "90" => InputBandwidth::Bw90k192kHz,
        other => bail!("unknown analyzer bandwidth '{other}' (20k, 40k, 90k)"),
    })
}

async fn list(registry: &InstrumentRegistry) -> Result<()> {
    println!("📋 Configured instruments");
    for info in registry.identify_all().await {
        match &info.identity {
            Ok(idn) => println!("  ✅ {:<16} {:<18} {}  {idn}", info.id, info.kind, info.resource),
            Err(e) => println!("  ❌ {:<16} {:<18} {}  {e}", info.id, info.kind, info.resource),
        }
    }
    println!();
    println!("🔍 Visible resources");
    for resource in registry.visible_resources().await? {
        println!("  {resource}");
    }
    Ok(())
}

async fn stepped_sweep(registry: &InstrumentRegistry, args: SweepArgs, cancel: &CancelToken) -> Result<()> {
    let table = SweepTable::from_csv(&args.table)?;
    let psu = registry.power_supply(args.id.as_deref()).await?;
    println!("📈 Stepped sweep: {} steps, {:.1} s", table.len(), table.total_dwell()?.as_secs_f64());
    let samples = run_stepped_sweep(&psu, args.channel, &table, cancel).await?;
    for s in &samples {
        println!(
            "  set {:.3} V / {:.3} A  →  measured {:.4} V / {:.4} A",
            s.set_voltage, s.set_current, s.measured_voltage, s.measured_current
        );
    }
    let path = args
        .output
        .unwrap_or_else(|| storage::timestamped_path(&registry.config().storage.output_dir, "sweep", "csv"));
    sweep::write_samples_csv(&path, &samples)?;
    println!("💾 Saved to {}", path.display());
    Ok(())
}

async fn list_sweep(registry: &InstrumentRegistry, args: SweepArgs, period: f64, cancel: &CancelToken) -> Result<()> {
    let table = SweepTable::from_csv(&args.table)?;
    let period = duration_from_secs("period", period)?;
    let psu = registry.power_supply(args.id.as_deref()).await?;
    println!("📈 List sweep: {} steps, {:.1} s", table.len(), table.total_dwell()?.as_secs_f64());
    let records = run_list_sweep(&psu, args.channel, &table, period, &registry.config().timing, cancel).await?;
    let path = args
        .output
        .unwrap_or_else(|| storage::timestamped_path(&registry.config().storage.output_dir, "list_sweep", "csv"));
    sweep::write_datalog_csv(&path, &records, period)?;
    println!("💾 {} records saved to {}", records.len(), path.display());
    Ok(())
}

async fn generate(registry: &InstrumentRegistry, args: GenerateArgs, cancel: &CancelToken) -> Result<()> {
    let duration = seconds_arg(args.seconds)?;
    let request = DualChannelRequest::new(args.wave.settings(), args.phase, duration);
    request.validate()?;
    let generator = registry.signal_generator(args.id.as_deref()).await?;
    println!(
        "📡 {}: {} {} Hz {} mV ({}) for {} s",
        generator.scpi().id(),
        args.wave.shape,
        args.wave.frequency,
        args.wave.amplitude_mv,
        args.phase,
        args.seconds
    );

    match args.clock {
        Some(clock_id) => {
            let clock_request = DualChannelRequest::clock(
                args.clock_frequency,
                args.clock_amplitude_mv,
                args.clock_offset_mv,
                args.clock_phase,
                duration,
            );
            let clock = registry.signal_generator(Some(clock_id.as_str())).await?;
            println!("⏲️  {clock_id}: clock {} Hz", args.clock_frequency);
            run_signal_and_clock(&generator, &request, &clock, &clock_request, cancel).await?;
        }
        None => run_dual_channel(&generator, &request, cancel).await?,
    }
    println!("✅ Outputs off");
    Ok(())
}

async fn sync(registry: &InstrumentRegistry, args: SyncArgs, cancel: &CancelToken) -> Result<()> {
    let burst = BurstSettings::new(args.wave.settings().with_phase(args.phase), args.cycles)
        .with_phase_offset(args.phase_offset);
    let primary = registry.signal_generator(args.primary.as_deref()).await?;
    let secondary_id = match args.secondary {
        Some(id) => id,
        None => registry
            .config()
            .enabled_instruments()
            .filter(|d| d.kind == bench_daq::config::InstrumentKind::SignalGenerator)
            .map(|d| d.id.clone())
            .find(|id| id != primary.scpi().id())
            .context("no second signal generator configured")?,
    };
    let secondary = registry.signal_generator(Some(secondary_id.as_str())).await?;
    println!(
        "🔗 {} → {secondary_id}: {} bursts, secondary at {}°",
        primary.scpi().id(),
        args.bursts,
        burst.secondary_phase()
    );

    let pair = DualGeneratorSync::new(primary, secondary, registry.config().timing);
    let report = pair.run(&burst, args.bursts, cancel).await?;
    for (when, snapshot) in [("before", &report.before), ("after", &report.after)] {
        for e in snapshot.primary.iter().chain(&snapshot.secondary) {
            println!("⚠️  error queue {when}: {e}");
        }
    }
    println!("✅ {} bursts fired, outputs off", report.bursts);
    Ok(())
}

async fn scope(registry: &InstrumentRegistry, args: ScopeArgs) -> Result<()> {
    let scope = registry.oscilloscope(args.id.as_deref()).await?;
    let generator = match &args.stimulus {
        Some(id) => Some(registry.signal_generator(Some(id.as_str())).await?),
        None => None,
    };
    let stimulus = Stimulus::from_optional_file(args.arb_file.as_deref())?;
    let request = ScopeCaptureRequest {
        channel: args.channel,
        points: args.points,
        label: args.label,
        comments: args.comments,
        output: args.output,
    };
    println!("📷 Capturing channel {} ({} points)...", request.channel, request.points);
    let outcome = capture_to_csv(
        &scope,
        generator.as_ref().map(|g| (g, &stimulus)),
        &request,
        &registry.config().timing,
        &registry.config().storage.output_dir,
    )
    .await?;
    println!("💾 {} samples saved to {}", outcome.waveform.len(), outcome.csv_path.display());
    if let Some(path) = outcome.comments_path {
        println!("📝 Comments saved to {}", path.display());
    }
    Ok(())
}

fn transfer(config: &BenchConfig, args: TransferArgs) -> Result<()> {
    let mut analyzer = TransferFunctionAnalyzer::new(positive("sample rate", args.sample_rate)?);
    match &args.output {
        Some(output) => analyzer.load_wav_files(&args.input, output)?,
        None => {
            let (x, y) = storage::read_two_columns(&args.input)?;
            analyzer.set_signals(&x, &y);
        }
    }
    let method = match args.method {
        Method::Welch { .. } => Method::Welch {
            window: args.window,
            nperseg: args.nperseg,
        },
        Method::Fft => Method::Fft,
    };
    analyzer.compute(method)?;
    let magnitude = analyzer.magnitude_db()?;
    let phase = analyzer.phase_deg()?;

    let path = args
        .save
        .unwrap_or_else(|| storage::timestamped_path(&config.storage.output_dir, "transfer_function", "csv"));
    storage::write_columns(
        &path,
        &["Frequency_Hz", "Magnitude_dB", "Phase_deg"],
        &[&magnitude.frequencies, &magnitude.values, &phase.values],
    )?;
    println!("💾 {method} estimate ({} bins) saved to {}", magnitude.len(), path.display());

    if let Some(test) = args.apply {
        let signal = storage::read_column(&test)?;
        let filtered = analyzer.apply(&signal)?;
        let out = test.with_file_name(format!(
            "{}_filtered.csv",
            test.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
        ));
        storage::write_columns(&out, &["Input", "Output"], &[&signal, &filtered])?;
        println!("💾 Filtered signal saved to {}", out.display());
    }
    Ok(())
}

fn gain(signals: &Path, frequencies: Option<&Path>) -> Result<()> {
    let (input, output) = storage::read_two_columns(signals)?;
    let summary = OpenLoopGain::new(input.clone(), output.clone()).measure()?;
    println!("📊 Open-loop gain");
    println!("  mean     {:.4}", summary.mean);
    println!("  std dev  {:.4}", summary.std_dev);
    println!("  typical  {:.4}", summary.typical);
    println!("  min      {:.4}", summary.min);

    let frequencies = frequencies.map(storage::read_column).transpose()?;
    let gbp = GainBandwidthProduct::new(input, output, frequencies);
    println!("  bandwidth {:.2} Hz", gbp.bandwidth()?);
    println!("  GBP       {:.2} Hz", gbp.product()?);
    Ok(())
}
