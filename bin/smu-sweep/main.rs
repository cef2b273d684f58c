mod cli;

use clap::Parser;
use crossbeam_channel::unbounded;
use env_logger::Env;
use log::{debug, error, info, warn, LevelFilter};
use rusty_smu::sink::{spawn_writer, timestamped_path};
use rusty_smu::waveform::voltages;
use rusty_smu::{
    exceeds_advisory, load_config_or_default, AppConfig, CancelToken, ChannelObserver,
    DefaultResourceManager, ExecutionMode, InstrumentSession, JsonlRecorder, LiveSampler,
    SmuError, SweepEvent, SweepExecutor, SweepOutcome, SweepPlan, HIGH_VOLTAGE_ADVISORY,
};
use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    thread::JoinHandle,
    time::Duration,
};

use crate::cli::{Args, Command, SweepArgs};

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let mut config = load_config_or_default(args.config.as_deref());
    apply_overrides(&mut config, &args);

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level)?;
    config.validate()?;
    log_startup_info(&config, args.config.as_deref());

    let cancel = setup_shutdown_handler()?;

    let manager = DefaultResourceManager::new()
        .with_serial_baud(config.instrument.serial_baud)
        .with_simulated(config.instrument.simulate);
    let mut session = InstrumentSession::new(manager);

    if !matches!(args.command, Command::List) {
        connect(&mut session, &config)?;
    }
    let result = run_command(&mut session, args.command, &config, &cancel);

    info!("Cleaning up and shutting down...");
    session.close();
    info!("Cleanup complete");

    result
}

// Helper Functions

/// Command-line values win over the configuration file
fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(resource) = &args.resource {
        config.instrument.resource = resource.clone();
    }
    if args.simulate {
        config.instrument.simulate = true;
    }
    if let Some(compliance) = args.compliance {
        config.instrument.default_compliance_ua = compliance;
    }
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== Rusty SMU ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!("Resource: {}", config.instrument.effective_resource());
    info!(
        "Compliance: {} uA, timeout {} ms",
        config.instrument.default_compliance_ua, config.instrument.timeout_ms
    );
    if config.logging.enabled {
        info!("Records: {}", config.logging.output_path);
    }
}

fn connect(session: &mut InstrumentSession, config: &AppConfig) -> Result<(), SmuError> {
    let resource = config.instrument.effective_resource();
    let identity = session.connect(&resource)?;
    info!("Connected: {} ({})", identity.raw, identity.dialect);

    session.set_timeout(config.instrument.timeout())?;
    session.set_compliance_microamps(config.instrument.default_compliance_ua)?;
    Ok(())
}

fn run_command(
    session: &mut InstrumentSession,
    command: Command,
    config: &AppConfig,
    cancel: &CancelToken,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::List => {
            let resources = session.list_resources()?;
            if resources.is_empty() {
                println!("No instruments found");
            }
            for resource in resources {
                println!("{resource}");
            }
        }
        Command::Idn => {
            let raw = session.query_identity()?;
            println!("{raw}");
            if let Some(identity) = session.identity() {
                println!("dialect: {}", identity.dialect);
            }
        }
        Command::Set {
            voltage,
            allow_high_voltage,
        } => {
            check_advisory([voltage], allow_high_voltage)?;
            session.set_voltage(voltage)?;
            let current = session.measure_current()?;
            println!("{voltage:.6}\t{current:.6e}");
            info!("Output is zeroed and disabled on exit");
        }
        Command::Measure => {
            let current = session.measure_current()?;
            println!("{:.6}\t{current:.6e}", session.last_voltage());
        }
        Command::Live {
            voltage,
            interval_ms,
            count,
            allow_high_voltage,
        } => {
            if let Some(v) = voltage {
                check_advisory([v], allow_high_voltage)?;
                session.set_voltage(v)?;
            }
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.live.interval());
            run_live(session, interval, count, config, cancel)?;
        }
        Command::Sweep(sweep) => run_sweep(session, sweep, config, cancel)?,
    }
    Ok(())
}

/// Refuse levels beyond the advisory unless acknowledged
fn check_advisory<I>(levels: I, allowed: bool) -> Result<(), Box<dyn Error>>
where
    I: IntoIterator<Item = f64>,
{
    if exceeds_advisory(levels) {
        if !allowed {
            return Err(format!(
                "Levels beyond ±{HIGH_VOLTAGE_ADVISORY} V require --allow-high-voltage"
            )
            .into());
        }
        warn!("Sourcing levels beyond ±{HIGH_VOLTAGE_ADVISORY} V");
    }
    Ok(())
}

fn run_live(
    session: &mut InstrumentSession,
    interval: Duration,
    count: Option<usize>,
    config: &AppConfig,
    cancel: &CancelToken,
) -> Result<(), Box<dyn Error>> {
    let recorder = create_recorder(config, "live", false)?;
    let (sender, receiver) = unbounded();
    let writer = spawn_writer(receiver, recorder, print_event);
    let mut observer = ChannelObserver::new(sender);

    info!("Sampling every {} ms (Ctrl+C to stop)", interval.as_millis());
    let result = LiveSampler::new(session, interval, config.live.max_points)
        .with_cancel_token(cancel.clone())
        .run(count, &mut observer);
    drop(observer);
    let written = join_writer(writer)?;

    let taken = result?;
    info!("✓ Live measurement finished: {taken} samples, {written} recorded");
    Ok(())
}

fn run_sweep(
    session: &mut InstrumentSession,
    sweep: SweepArgs,
    config: &AppConfig,
    cancel: &CancelToken,
) -> Result<(), Box<dyn Error>> {
    let delay_s = sweep.delay_s(config.sweep.delay_s);
    let points = sweep
        .waveform
        .points(config.sweep.step, config.sweep.cycles, delay_s);
    check_advisory(voltages(&points), sweep.allow_high_voltage)?;

    let mode = if sweep.fast {
        ExecutionMode::InstrumentTimed
    } else {
        config.sweep.execution
    };
    let plan = SweepPlan::new(points, mode, delay_s)?
        .with_fast_limit(sweep.fast_limit.unwrap_or(config.sweep.fast_limit));
    plan.validate()?;

    let prefix = format!("sweep_{}", sweep.waveform.name());
    let recorder = create_recorder(config, &prefix, sweep.no_record)?;
    let (sender, receiver) = unbounded();
    let writer = spawn_writer(receiver, recorder, print_event);
    let mut observer = ChannelObserver::new(sender);

    info!("Waveform: {}", sweep.waveform.name());
    let mut executor = SweepExecutor::new(session).with_cancel_token(cancel.clone());
    let result = executor.execute(&plan, &mut observer);
    drop(observer);
    let written = join_writer(writer)?;

    match result {
        Ok(report) => {
            match report.outcome {
                SweepOutcome::Completed => info!(
                    "✓ Sweep completed: {}/{} points",
                    report.points_emitted, report.total
                ),
                SweepOutcome::Cancelled => info!(
                    "✓ Sweep stopped by user after {}/{} points",
                    report.points_emitted, report.total
                ),
            }
            debug!("{written} records written");
            Ok(())
        }
        Err(e) => {
            error!("✗ Sweep failed: {e}");
            Err(e.into())
        }
    }
}

fn print_event(event: &SweepEvent) {
    match event {
        SweepEvent::Status(status) => info!("{status}"),
        SweepEvent::Progress(p) => debug!(
            "Progress {}/{} ({:.0}%), ETA {:.1} s",
            p.index,
            p.total,
            p.fraction() * 100.0,
            p.eta.as_secs_f64()
        ),
        SweepEvent::Measurement(r) => {
            println!("{}\t{:.6}\t{:.6e}", r.index, r.voltage, r.current)
        }
    }
}

fn create_recorder(
    config: &AppConfig,
    prefix: &str,
    disabled: bool,
) -> Result<Option<JsonlRecorder>, Box<dyn Error>> {
    if disabled || !config.logging.enabled {
        return Ok(None);
    }
    let path = create_record_path(&config.logging.output_dir(), prefix)?;
    info!("Recording to {}", path.display());
    Ok(Some(JsonlRecorder::new(path, config.logging.buffer_size)))
}

fn create_record_path(dir: &Path, prefix: &str) -> Result<PathBuf, Box<dyn Error>> {
    fs::create_dir_all(dir)?;
    Ok(timestamped_path(dir, prefix))
}

fn join_writer(writer: JoinHandle<Result<usize, SmuError>>) -> Result<usize, Box<dyn Error>> {
    let written = writer
        .join()
        .map_err(|_| "Record writer thread panicked")??;
    Ok(written)
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<CancelToken, ctrlc::Error> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current point...");
        handler_token.cancel();
    })?;

    Ok(cancel)
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}
