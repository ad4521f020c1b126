//! UsbScope - command-line front end
//!
//! Runs the acquisition pipeline against the simulated scope and prints one
//! status line per received frame.

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use usbscope::device::sim::SimConfig;
use usbscope::device::{TriggerEdge, TriggerSource};
use usbscope::export::{self, Columns};
use usbscope::{Acquisition, ArmMode, DataFrame, ScopeConfig, SimulatedDevice};

/// Command-line parsing errors
#[derive(Error, Debug)]
enum ArgError {
    #[error("{0} requires a value")]
    MissingValue(&'static str),

    #[error("Invalid value for {flag}: {value}")]
    InvalidValue { flag: &'static str, value: String },

    #[error("Unknown argument: {0}")]
    Unknown(String),
}

#[derive(Debug, Default)]
struct Options {
    mode: Option<ArmMode>,
    frames: Option<u64>,
    pre_trigger: Option<usize>,
    decimation: Option<u32>,
    interval_ms: Option<u64>,
    trigger_source: Option<TriggerSource>,
    edge: Option<TriggerEdge>,
    auto: Option<bool>,
    attenuation_db: Option<f64>,
    config: Option<PathBuf>,
    export: Option<PathBuf>,
    json: bool,
}

enum Command {
    Run(Options),
    Help,
    Version,
}

/// Printed with `--json` when the run ends
#[derive(Debug, Serialize)]
struct RunSummary {
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    frames_received: u64,
    cycles: u64,
    published: u64,
    dropped: u64,
    discarded: u64,
    timeouts: u64,
    overruns: u64,
    avg_cycle_ms: f64,
    exported: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("usbscope=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(Command::Run(options)) => options,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("usbscope {} ({})", usbscope::VERSION, usbscope::BUILD_DATE);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            return Ok(());
        }
    };

    println!("UsbScope v{} - simulated acquisition", usbscope::VERSION);
    println!();

    run(options)
}

fn value<'a>(args: &'a [String], i: usize, flag: &'static str) -> Result<&'a str, ArgError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or(ArgError::MissingValue(flag))
}

fn parsed<T: std::str::FromStr>(raw: &str, flag: &'static str) -> Result<T, ArgError> {
    raw.parse().map_err(|_| ArgError::InvalidValue {
        flag,
        value: raw.to_string(),
    })
}

fn switch(raw: &str, flag: &'static str) -> Result<bool, ArgError> {
    match raw.to_ascii_lowercase().as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(ArgError::InvalidValue {
            flag,
            value: raw.to_string(),
        }),
    }
}

fn parse_args(args: &[String]) -> Result<Command, ArgError> {
    let mut options = Options::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(Command::Help),
            "--version" | "-v" => return Ok(Command::Version),
            "--json" => {
                options.json = true;
                i += 1;
                continue;
            }
            "--mode" | "-m" => {
                options.mode = Some(parsed(value(args, i, "--mode")?, "--mode")?);
            }
            "--frames" | "-n" => {
                options.frames = Some(parsed(value(args, i, "--frames")?, "--frames")?);
            }
            "--pre-trigger" => {
                options.pre_trigger =
                    Some(parsed(value(args, i, "--pre-trigger")?, "--pre-trigger")?);
            }
            "--decimation" | "-d" => {
                options.decimation =
                    Some(parsed(value(args, i, "--decimation")?, "--decimation")?);
            }
            "--interval-ms" => {
                options.interval_ms =
                    Some(parsed(value(args, i, "--interval-ms")?, "--interval-ms")?);
            }
            "--trigger-source" | "-t" => {
                options.trigger_source = Some(parsed(
                    value(args, i, "--trigger-source")?,
                    "--trigger-source",
                )?);
            }
            "--edge" => {
                options.edge = Some(parsed(value(args, i, "--edge")?, "--edge")?);
            }
            "--auto" => {
                options.auto = Some(switch(value(args, i, "--auto")?, "--auto")?);
            }
            "--atten" => {
                options.attenuation_db = Some(parsed(value(args, i, "--atten")?, "--atten")?);
            }
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value(args, i, "--config")?));
            }
            "--export" | "-o" => {
                options.export = Some(PathBuf::from(value(args, i, "--export")?));
            }
            other => return Err(ArgError::Unknown(other.to_string())),
        }
        i += 2;
    }

    Ok(Command::Run(options))
}

fn print_help() {
    println!("Usage: usbscope [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -m, --mode MODE         Trigger mode: off, single, continuous (default: continuous)");
    println!("  -n, --frames N          Stop after N frames (default: run until Ctrl+C)");
    println!("      --pre-trigger N     Pretrigger samples");
    println!("  -d, --decimation N      Total decimation (1..65536)");
    println!("      --interval-ms MS    Loop poll interval (default: 100)");
    println!("  -t, --trigger-source S  Trigger source: a, b, ext");
    println!("      --edge EDGE         Trigger edge: rising, falling");
    println!("      --auto on|off       Auto trigger after 100 ms without a trigger");
    println!("      --atten DB          Variable attenuation for all channels (0..20 dB)");
    println!("  -c, --config PATH       Load settings from a JSON config file");
    println!("  -o, --export PATH       Write the last frame to PATH as text");
    println!("      --json              Print a JSON run summary on exit");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  usbscope --mode single --export frame.txt");
    println!("  usbscope -n 50 -d 16 --interval-ms 20");
    println!("  usbscope -t b --edge falling --auto off --atten 6");
}

fn build_config(options: &Options, channels: usize) -> ScopeConfig {
    let mut config = match &options.config {
        Some(path) => ScopeConfig::load(path),
        None => ScopeConfig::default(),
    };
    if let Some(mode) = options.mode {
        config.initial_mode = mode;
    }
    if options.pre_trigger.is_some() {
        config.pre_trigger_samples = options.pre_trigger;
    }
    if options.decimation.is_some() {
        config.decimation = options.decimation;
    }
    if let Some(ms) = options.interval_ms {
        config.poll_interval_ms = ms;
    }
    if options.trigger_source.is_some() {
        config.trigger_source = options.trigger_source;
    }
    if options.edge.is_some() {
        config.trigger_edge = options.edge;
    }
    if options.auto.is_some() {
        config.auto_trigger = options.auto;
    }
    if let Some(db) = options.attenuation_db {
        config.attenuation_db = vec![db; channels];
    }
    config
}

fn status_line(frame_no: u64, frame: &DataFrame) -> String {
    let mut line = format!(
        "{} | frame {:>6}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        frame_no
    );
    for (ch, summary) in frame.channels.iter().enumerate() {
        let name = (b'A' + ch as u8) as char;
        line.push_str(&format!(
            " | {}: mean {:>8.2} sdev {:>7.2}{}",
            name,
            summary.mean,
            summary.stddev,
            if summary.overflow { " OVF" } else { "" }
        ));
    }
    line
}

fn run(options: Options) -> Result<()> {
    let sim = SimConfig::default();
    let config = build_config(&options, sim.channels);
    let device = Arc::new(SimulatedDevice::new(sim));
    let started = Utc::now();

    let mut acquisition = match Acquisition::start(device, &config) {
        Ok(a) => a,
        Err(e) => {
            error!("Failed to start acquisition: {}", e);
            println!("Error: {}", e);
            return Ok(());
        }
    };

    println!(
        "Mode: {} | pool: {} | interval: {} ms. Press Ctrl+C to stop.",
        config.initial_mode, config.pool_size, config.poll_interval_ms
    );
    println!("────────────────────────────────────────");

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let mut received = 0u64;
    let mut last_frame = None;
    while running.load(Ordering::SeqCst) {
        match acquisition
            .data_ready()
            .recv_timeout(Duration::from_millis(200))
        {
            Ok(()) => {
                let Some(frame) = acquisition.take_data() else {
                    continue;
                };
                received += 1;
                println!("{}", status_line(received, &frame.read().frame()));
                last_frame = Some(frame);

                if options.frames.is_some_and(|n| received >= n) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !acquisition.is_running() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let mut exported = None;
    if let Some(path) = &options.export {
        let columns = Columns::TimeAndChannel(config.export_channel);
        match export::export_scoped(last_frame.as_ref(), columns, path) {
            Ok(lines) => {
                println!("Exported {} samples to {}", lines, path.display());
                exported = Some(path.clone());
            }
            Err(e) => {
                warn!("Export failed: {}", e);
                println!("Export failed: {}", e);
            }
        }
    }
    drop(last_frame);

    println!();
    println!("Stopping...");
    let stats = acquisition.stats();
    if let Err(e) = acquisition.stop() {
        error!("Acquisition ended with error: {}", e);
        println!("Error: {}", e);
    }
    info!(
        frames = received,
        published = stats.published,
        dropped = stats.dropped,
        "Acquisition finished"
    );

    if options.json {
        let summary = RunSummary {
            started,
            finished: Utc::now(),
            frames_received: received,
            cycles: stats.cycles,
            published: stats.published,
            dropped: stats.dropped,
            discarded: stats.discarded,
            timeouts: stats.timeouts,
            overruns: stats.overruns,
            avg_cycle_ms: stats.avg_cycle_ms,
            exported,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    println!("Done.");

    Ok(())
}
