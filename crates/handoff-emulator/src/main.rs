//! # Handover emulator
//!
//! Loads a timeline script, binds the kernel packet queues it names and
//! replays its handover actions in real time.
//!
//! ## Usage
//!
//! ```bash
//! # Default: per-packet seq/ack trace to ./packet.log
//! handoff-emulator run-42 timeline.csv
//!
//! # Everything at trace level to ./debug.log, tuned config, JSON report
//! handoff-emulator run-42 timeline.csv --log-profile debug \
//!   --config emulator.toml --stats-json run-42.json
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use handoff_core::action::Dispatcher;
use handoff_core::capture::session::PACKET_TRACE_TARGET;
use handoff_core::capture::CaptureOpener;
use handoff_core::config::EmulatorConfig;
use handoff_core::scheduler::{EventScheduler, MonotonicClock};
use handoff_core::stats::RunReport;
use handoff_core::timeline::Timeline;

/// Exit status for bad arguments or unreadable inputs.
const EXIT_FAILURE: i32 = -1;

/// Handover emulator.
#[derive(Parser, Debug)]
#[command(name = "handoff-emulator", about = "Replays a handover timeline against live TCP traffic")]
struct Cli {
    /// Run identifier, echoed in the banner and the run report.
    run_id: String,

    /// Timeline script.
    timeline: PathBuf,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// What goes to the log file.
    #[arg(long, value_enum, default_value_t = LogProfile::Packet)]
    log_profile: LogProfile,

    /// Log file path (defaults to ./packet.log or ./debug.log).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write a JSON run report here when the run ends.
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogProfile {
    /// Per-packet seq/ack trace lines only.
    Packet,
    /// Everything at trace level.
    Debug,
}

impl LogProfile {
    fn default_path(self) -> &'static str {
        match self {
            LogProfile::Packet => "packet.log",
            LogProfile::Debug => "debug.log",
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.exit();
            }
            let _ = e.print();
            std::process::exit(EXIT_FAILURE);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("handoff-emulator: {e:#}");
        std::process::exit(EXIT_FAILURE);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    println!("[Emulator] {}", cli.run_id);

    // ── Logging ─────────────────────────────────────────────────
    let log_path = cli
        .log_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(cli.log_profile.default_path()));
    init_logging(cli.log_profile, &log_path)?;

    // ── Config ──────────────────────────────────────────────────
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            EmulatorConfig::from_toml_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => EmulatorConfig::default(),
    };

    // ── Timeline ────────────────────────────────────────────────
    println!("Reading input");
    let text = std::fs::read_to_string(&cli.timeline)
        .with_context(|| format!("reading timeline {}", cli.timeline.display()))?;
    let timeline = Timeline::parse(&text);
    if !timeline.errors.is_empty() {
        tracing::warn!(skipped = timeline.errors.len(), "timeline has malformed lines");
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            tracing::info!("interrupted, ending run");
            stop.store(true, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    let mut scheduler = EventScheduler::new(&config.scheduler).with_stop_flag(stop);
    let scheduled = timeline.schedule_into(&mut scheduler);
    let mut dispatcher = Dispatcher::new(capture_opener()?, config);

    tracing::info!(
        run_id = %cli.run_id,
        timeline = %cli.timeline.display(),
        events = scheduled,
        log_profile = ?cli.log_profile,
        "handoff-emulator starting"
    );

    // ── Run ─────────────────────────────────────────────────────
    println!("Emulator starts");
    let summary = scheduler.run(&mut dispatcher, &MonotonicClock::new());
    dispatcher.shutdown();
    println!("Emulator ends");

    let report = RunReport {
        run_id: cli.run_id.clone(),
        events_scheduled: scheduled,
        events_executed: summary.events_executed,
        controller_ticks: summary.ticks,
        interrupted: summary.interrupted,
        elapsed_ms: summary.elapsed_ms,
        queues: dispatcher.queue_stats(),
    };
    tracing::info!(
        executed = report.events_executed,
        ticks = report.controller_ticks,
        interrupted = report.interrupted,
        elapsed_ms = report.elapsed_ms,
        "handoff-emulator stopped"
    );

    if let Some(path) = &cli.stats_json {
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("writing run report {}", path.display()))?;
    }
    Ok(())
}

/// Console gets `RUST_LOG` (default `info`) on stderr; the log file gets
/// what the profile selects.
fn init_logging(profile: LogProfile, path: &Path) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating log file {}", path.display()))?;

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let file_layer = match profile {
        LogProfile::Packet => tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .without_time()
            .with_level(false)
            .with_target(false)
            .with_filter(EnvFilter::new(format!("{PACKET_TRACE_TARGET}=trace")))
            .boxed(),
        LogProfile::Debug => tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_thread_names(true)
            .with_filter(EnvFilter::new("trace"))
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn capture_opener() -> anyhow::Result<Box<dyn CaptureOpener>> {
    Ok(Box::new(handoff_core::capture::NfQueueOpener))
}

#[cfg(not(target_os = "linux"))]
fn capture_opener() -> anyhow::Result<Box<dyn CaptureOpener>> {
    anyhow::bail!("NFQUEUE capture is only available on Linux")
}
