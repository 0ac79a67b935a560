//! ioforge CLI entry point
//!
//! Wires the pieces together: parse and validate flags, initialize logging,
//! start the controller and the stdin command reader, then run the outer
//! loop that applies the timed command script, enforces the duration bound,
//! emits periodic STATS lines, and tears everything down gracefully on
//! stop, EOF, fault, or signal.

use anyhow::Context;
use clap::Parser;
use ioforge::command::CommandReader;
use ioforge::config::cli::Cli;
use ioforge::config::script::CommandScript;
use ioforge::config::{LiveConfig, Settings};
use ioforge::controller::Controller;
use ioforge::stats::{StatsAccumulator, StatsReporter};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

fn main() {
    let cli = Cli::parse();

    let settings = match Settings::from_cli(cli) {
        Ok(settings) => settings,
        Err(err) => {
            // Logging is not up yet; report straight to stderr
            eprintln!("ioforge: {:#}", err);
            std::process::exit(1);
        }
    };

    init_logging(&settings);
    info!(
        "initializing ioforge version {}",
        env!("CARGO_PKG_VERSION")
    );
    info!("parameters: {:?}", settings);

    match run(settings) {
        Ok(()) => {
            info!("exit(0)");
        }
        Err(err) => {
            error!("{:#}", err);
            info!("exit(1)");
            std::process::exit(1);
        }
    }
}

fn init_logging(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if settings.log_time_prefix {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

fn run(settings: Settings) -> ioforge::Result<()> {
    let settings = Arc::new(settings);
    let live = Arc::new(LiveConfig::new(&settings));
    let stats = Arc::new(StatsAccumulator::new());
    let mut script =
        CommandScript::parse(&settings.command_script).context("invalid command_script")?;

    // SIGINT/SIGTERM request a graceful stop; the default handler is
    // re-raised after teardown
    let term_signal = Arc::new(AtomicUsize::new(0));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register_usize(sig, Arc::clone(&term_signal), sig as usize)
            .context("failed to install signal handler")?;
    }

    let controller = Controller::new(Arc::clone(&settings), Arc::clone(&live), Arc::clone(&stats))?;
    let reader = CommandReader::spawn(Arc::clone(&live));
    let mut reporter = StatsReporter::new(Duration::from_secs(settings.stats_interval));

    let started = Instant::now();
    let outcome = loop {
        match controller.is_active() {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(fault) => break Err(fault),
        }
        if !reader.is_active() {
            break Ok(());
        }

        let signal = term_signal.load(Ordering::Relaxed);
        if signal != 0 {
            warn!("received signal {}", signal);
            break Ok(());
        }

        let elapsed_secs = started.elapsed().as_secs();
        let mut stopped = false;
        while let Some(entry) = script.pop_due(elapsed_secs) {
            info!(
                "command_script time={}, command: {}",
                entry.at_secs, entry.command
            );
            if entry.command == "stop" || entry.command.starts_with("stop=") {
                stopped = true;
                break;
            }
            if let Err(err) = live.execute_command(&entry.command) {
                error!("{:#}", err);
            }
        }
        if stopped {
            break Ok(());
        }

        if settings.duration > 0 && started.elapsed().as_secs() > settings.duration {
            info!("duration time exceeded: {} seconds", settings.duration);
            break Ok(());
        }

        std::thread::sleep(Duration::from_millis(200));

        if let Some(line) = reporter.tick(stats.snapshot(), &live) {
            info!("{}", line);
        }
    };

    // Graceful teardown: reader first so no further commands land while the
    // controller drains and cancels in-flight requests
    reader.stop();
    controller.stop();
    drop(reader);
    drop(controller);

    let signal = term_signal.load(Ordering::Relaxed);
    if signal != 0 {
        // Hand the signal back to the default disposition
        let _ = signal_hook::low_level::emulate_default_handler(signal as i32);
    }

    outcome
}
