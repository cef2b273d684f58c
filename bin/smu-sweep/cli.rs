use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use rusty_smu::safety::FastLimit;
use rusty_smu::waveform::{
    custom_sequence, hold_sequence, linear_sweep, simple_cycle, SweepPoint, SweepPreset,
    WrerParams,
};
use std::path::PathBuf;

/// Keithley SMU sweep tool
#[derive(Parser, Debug)]
#[command(name = "smu-sweep")]
#[command(about = "Source-measure sweeps on Keithley 2400/2600 instruments", long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Instrument resource, e.g. GPIB0::24::INSTR
    #[arg(short, long, value_name = "RESOURCE")]
    pub resource: Option<String>,

    /// Use the built-in simulated instrument
    #[arg(long)]
    pub simulate: bool,

    /// Current compliance in microamps
    #[arg(long, value_name = "UA")]
    pub compliance: Option<f64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List available instrument resources
    List,
    /// Connect and print the instrument identity
    Idn,
    /// Source a voltage and read the current once
    #[command(allow_negative_numbers = true)]
    Set {
        voltage: f64,
        #[arg(long)]
        allow_high_voltage: bool,
    },
    /// Read the current at the present output state
    Measure,
    /// Sample the current repeatedly until Ctrl+C
    #[command(allow_negative_numbers = true)]
    Live {
        /// Level to source before sampling
        #[arg(long)]
        voltage: Option<f64>,
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,
        /// Stop after this many samples
        #[arg(long)]
        count: Option<usize>,
        #[arg(long)]
        allow_high_voltage: bool,
    },
    /// Run a sweep
    Sweep(SweepArgs),
}

#[derive(ClapArgs, Debug)]
pub struct SweepArgs {
    #[command(subcommand)]
    pub waveform: Waveform,

    /// Run the whole sweep as one instrument-timed loop (2600 series only)
    #[arg(long, global = true)]
    pub fast: bool,

    /// Inter-point delay in seconds; also the wrer sample interval
    #[arg(long, global = true, value_name = "SECONDS")]
    pub delay: Option<f64>,

    /// Lower bound on the instrument-timed delay: 1ms or 500ns
    #[arg(long, global = true, value_parser = parse_fast_limit)]
    pub fast_limit: Option<FastLimit>,

    /// Acknowledge levels beyond the high-voltage advisory
    #[arg(long, global = true)]
    pub allow_high_voltage: bool,

    /// Do not write a record file
    #[arg(long, global = true)]
    pub no_record: bool,
}

#[derive(Subcommand, Debug)]
pub enum Waveform {
    /// start -> stop in fixed steps
    #[command(allow_negative_numbers = true)]
    Linear { start: f64, stop: f64, step: f64 },
    /// One of the canned sweeps
    Preset {
        #[arg(value_enum)]
        name: PresetArg,
    },
    /// 0 -> +peak -> 0 -> -peak -> 0
    #[command(allow_negative_numbers = true)]
    Cycle {
        peak: f64,
        #[arg(long)]
        step: Option<f64>,
        #[arg(long)]
        cycles: Option<u32>,
    },
    /// Chained FROM:TO segments
    #[command(allow_negative_numbers = true)]
    Custom {
        #[arg(required = true, value_parser = parse_segment, value_name = "FROM:TO")]
        segments: Vec<(f64, f64)>,
        #[arg(long)]
        step: Option<f64>,
        #[arg(long)]
        cycles: Option<u32>,
    },
    /// Write-read-erase-read hold sequence, sampled every `--delay` seconds
    #[command(allow_negative_numbers = true)]
    Wrer {
        #[arg(long)]
        write_v: f64,
        #[arg(long)]
        write_t: f64,
        #[arg(long)]
        read_v: f64,
        #[arg(long)]
        read_t: f64,
        #[arg(long)]
        erase_v: f64,
        #[arg(long)]
        erase_t: f64,
        #[arg(long)]
        cycles: Option<u32>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum PresetArg {
    #[value(name = "0-1")]
    ZeroToOne,
    #[value(name = "0-5")]
    ZeroToFive,
    #[value(name = "pm1")]
    MinusOneToOne,
}

impl From<PresetArg> for SweepPreset {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::ZeroToOne => SweepPreset::ZeroToOne,
            PresetArg::ZeroToFive => SweepPreset::ZeroToFive,
            PresetArg::MinusOneToOne => SweepPreset::MinusOneToOne,
        }
    }
}

impl SweepArgs {
    /// Inter-point delay, falling back to `default_delay_s`.
    pub fn delay_s(&self, default_delay_s: f64) -> f64 {
        self.delay.unwrap_or(default_delay_s)
    }
}

impl Waveform {
    /// Expand into sweep points, using `default_step`/`default_cycles` where
    /// the command line left them out. Hold sequences are sampled at
    /// `delay_s`, the same spacing the sweep runs at.
    pub fn points(&self, default_step: f64, default_cycles: u32, delay_s: f64) -> Vec<SweepPoint> {
        match self {
            Waveform::Linear { start, stop, step } => linear_sweep(*start, *stop, *step),
            Waveform::Preset { name } => SweepPreset::from(*name).points(),
            Waveform::Cycle { peak, step, cycles } => simple_cycle(
                *peak,
                step.unwrap_or(default_step),
                cycles.unwrap_or(default_cycles),
            ),
            Waveform::Custom {
                segments,
                step,
                cycles,
            } => custom_sequence(
                segments,
                step.unwrap_or(default_step),
                cycles.unwrap_or(default_cycles),
            ),
            Waveform::Wrer {
                write_v,
                write_t,
                read_v,
                read_t,
                erase_v,
                erase_t,
                cycles,
            } => hold_sequence(&WrerParams {
                write_v: *write_v,
                write_t: *write_t,
                read_v: *read_v,
                read_t: *read_t,
                erase_v: *erase_v,
                erase_t: *erase_t,
                sample_interval: delay_s,
                cycles: cycles.unwrap_or(default_cycles),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Waveform::Linear { .. } => "linear",
            Waveform::Preset { .. } => "preset",
            Waveform::Cycle { .. } => "cycle",
            Waveform::Custom { .. } => "custom",
            Waveform::Wrer { .. } => "wrer",
        }
    }
}

fn parse_segment(s: &str) -> Result<(f64, f64), String> {
    let (from, to) = s
        .split_once(':')
        .ok_or_else(|| format!("expected FROM:TO, got '{s}'"))?;
    let from = from
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad segment start '{from}': {e}"))?;
    let to = to
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad segment end '{to}': {e}"))?;
    Ok((from, to))
}

fn parse_fast_limit(s: &str) -> Result<FastLimit, String> {
    match s.to_ascii_lowercase().as_str() {
        "1ms" => Ok(FastLimit::OneMillisecond),
        "500ns" => Ok(FastLimit::FiveHundredNanoseconds),
        _ => Err(format!("expected 1ms or 500ns, got '{s}'")),
    }
}
