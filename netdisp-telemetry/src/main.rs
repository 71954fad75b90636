//! Headless display driver for the netdisp board.
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use netdisp_telemetry::collect::cpu_idle::{IdleDecayEstimator, ProcStatSource};
use netdisp_telemetry::collect::feed::{self, DEFAULT_MAX_LINES, PortFeed};
use netdisp_telemetry::collect::ports::PortTable;
use netdisp_telemetry::config::DisplayConfig;
use netdisp_telemetry::display::{DisplayFrame, busy_percent};
use netdisp_telemetry::monitor::{CpuMonitor, CpuSettings, PortMonitor, next_deadline};
use netdisp_telemetry::{LogConfig, LogFormat, init_logging};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "netdisp", about = "CPU load and switch port telemetry for the board display")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Console log style (overrides NETDISP_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormatArg>,

    /// Also write JSON logs to this file (overrides NETDISP_LOG_FILE)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy)]
enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Compact => Self::Compact,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the refresh loop and print one JSON frame per cycle
    Run {
        /// Stop after this many frames
        #[arg(long)]
        cycles: Option<u64>,

        /// Toggle a switch port before the first cycle (repeatable)
        #[arg(long = "toggle", value_name = "PORT")]
        toggle: Vec<usize>,

        /// Idle counter file (overrides NETDISP_STAT_PATH)
        #[arg(long)]
        stat_path: Option<PathBuf>,

        /// Port telemetry pipe (overrides NETDISP_FEED_PATH)
        #[arg(long)]
        feed_path: Option<PathBuf>,
    },

    /// Apply a recorded port feed and print the resulting frame
    Replay {
        /// Recorded feed file
        file: PathBuf,
    },

    /// Print smoothed idle time per core
    Sample {
        /// Number of perf periods to sample
        #[arg(long, default_value_t = 10)]
        samples: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format.into());
    }
    if let Some(path) = cli.log_file {
        log_config = log_config.with_file(path);
    }
    let _logging_guards = init_logging(&log_config)?;

    let mut config = DisplayConfig::from_env().context("failed to load NETDISP_* settings")?;

    match cli.command {
        Commands::Run {
            cycles,
            toggle,
            stat_path,
            feed_path,
        } => {
            config.stat_path = config.stat_path.override_with(stat_path, "--stat-path");
            config.feed_path = config.feed_path.override_with(feed_path, "--feed-path");
            config.validate()?;
            run(&config, &toggle, cycles)
        }
        Commands::Replay { file } => {
            config.validate()?;
            replay(&config, file)
        }
        Commands::Sample { samples } => {
            config.validate()?;
            sample(&config, samples)
        }
    }
}

fn cpu_settings(config: &DisplayConfig) -> CpuSettings {
    CpuSettings {
        cores: config.core_count(),
        decay_num: config.decay_num.value,
        decay_den: config.decay_den.value,
        period_ms: config.perf_period_ms.value,
        max_busy_percent: config.max_busy_percent.value,
    }
}

fn port_table(config: &DisplayConfig) -> PortTable {
    PortTable::new(config.remap.value).with_unused_ports(&config.unused_port_indices())
}

fn run(config: &DisplayConfig, toggles: &[usize], cycles: Option<u64>) -> Result<()> {
    let feed = PortFeed::open(&config.feed_path.value)
        .with_context(|| {
            format!(
                "cannot open port feed {} (from {})",
                config.feed_path.value.display(),
                config.feed_path.source
            )
        })?;

    let mut cpu = CpuMonitor::new(ProcStatSource::new(&config.stat_path.value), cpu_settings(config));
    let mut ports = PortMonitor::new(port_table(config), Some(feed), DEFAULT_MAX_LINES);
    for &port in toggles {
        ports.toggle(port);
    }

    let perf_period = Duration::from_millis(config.perf_period_ms.value);
    let port_period = Duration::from_millis(config.port_period_ms.value);
    info!(
        stat_path = %config.stat_path.value.display(),
        feed_path = %config.feed_path.value.display(),
        perf_period_ms = config.perf_period_ms.value,
        port_period_ms = config.port_period_ms.value,
        cores = config.core_count(),
        "Display loop starting"
    );

    let start = Instant::now();
    let mut next_perf = start;
    let mut next_port = start;
    let mut frames = 0u64;

    while cycles.is_none_or(|limit| frames < limit) {
        let now = Instant::now();
        let perf_due = now >= next_perf;
        let port_due = now >= next_port;

        if !perf_due && !port_due {
            std::thread::sleep(next_perf.min(next_port) - now);
            continue;
        }

        if perf_due {
            cpu.refresh();
            next_perf = next_deadline(next_perf, perf_period, now);
        }
        let (transitions, utilization) = if port_due {
            next_port = next_deadline(next_port, port_period, now);
            let cycle = ports.refresh();
            if cycle.drained.truncated {
                debug!("Port feed still has data, continuing next cycle");
            }
            (cycle.transitions, cycle.utilization)
        } else {
            (Vec::new(), ports.table().utilization())
        };

        let frame = DisplayFrame::new(cpu.busy().to_vec(), transitions, utilization);
        match frame.to_json() {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Failed to serialize display frame"),
        }
        frames += 1;
    }

    info!(frames = frames, elapsed_ms = start.elapsed().as_millis() as u64, "Display loop finished");
    Ok(())
}

fn replay(config: &DisplayConfig, file: PathBuf) -> Result<()> {
    let mut port_feed = PortFeed::open(&file)?;
    let mut table = port_table(config);

    let mut applied = 0usize;
    let mut rejected = 0usize;
    loop {
        let summary = feed::drain(&mut port_feed, &mut table, DEFAULT_MAX_LINES)?;
        applied += summary.applied.len();
        rejected += summary.rejected;
        if !summary.truncated {
            break;
        }
    }
    if port_feed.pending_bytes() > 0 {
        warn!(bytes = port_feed.pending_bytes(), "Ignoring unterminated last line");
    }
    info!(applied = applied, rejected = rejected, file = %file.display(), "Feed replayed");

    let transitions = table.reconcile();
    let frame = DisplayFrame::new(Vec::new(), transitions, table.utilization());
    println!("{}", frame.to_json_pretty()?);
    Ok(())
}

fn sample(config: &DisplayConfig, samples: u64) -> Result<()> {
    let settings = cpu_settings(config);
    let period = Duration::from_millis(settings.period_ms);
    let mut source = ProcStatSource::new(&config.stat_path.value);
    let mut estimator = IdleDecayEstimator::new();

    for round in 0..samples {
        for core in 0..settings.cores {
            let calibrated = estimator.is_calibrated(core);
            let idle_ms =
                estimator.sample(&mut source, core, settings.decay_num, settings.decay_den)?;
            // the baseline round has no idle figure yet
            let busy = calibrated
                .then(|| busy_percent(settings.period_ms, idle_ms, settings.max_busy_percent));
            let line = serde_json::json!({
                "round": round,
                "core": core,
                "idle_ms": calibrated.then_some(idle_ms),
                "busy_percent": busy,
            });
            println!("{line}");
        }
        if round + 1 < samples {
            std::thread::sleep(period);
        }
    }

    Ok(())
}
