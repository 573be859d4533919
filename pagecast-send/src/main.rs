//! pagecast-send - Trigger for the scheduled-publish queue
//!
//! Runs one processing cycle (`--once`) or keeps firing cycles on an interval.

use clap::Parser;
use libpagecast::logging::LoggingConfig;
use libpagecast::{Config, Database, PagecastError, QueueProcessor, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pagecast-send")]
#[command(version)]
#[command(about = "Process due scheduled posts")]
#[command(long_about = "\
pagecast-send - Process due scheduled posts

DESCRIPTION:
    pagecast-send triggers processing cycles of the Pagecast publish queue.
    Each cycle enqueues posts whose scheduled time has passed, re-arms
    retries whose backoff has elapsed, reclaims items abandoned by a crashed
    worker, then claims a bounded batch and publishes it to Facebook and
    Instagram.

USAGE:
    # Run a single cycle and print the report as JSON
    pagecast-send --once

    # Claim up to 10 items per cycle, every 30 seconds
    pagecast-send --batch-size 10 --poll-interval 30

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current cycle)

CONFIGURATION:
    Configuration file: ~/.config/pagecast/config.toml
    Database location: ~/.local/share/pagecast/queue.db

    Override with environment variables:
        PAGECAST_CONFIG      - Path to config file
        PAGECAST_DB_PATH     - Path to database file
        PAGECAST_LOG_FORMAT  - text, json or pretty
        PAGECAST_LOG_LEVEL   - Log filter (default: info)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
    3 - Invalid input
")]
struct Cli {
    /// Seconds between cycles (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Items claimed per cycle, 1-20 (overrides config)
    #[arg(short, long, value_name = "N")]
    #[arg(value_parser = clap::value_parser!(u64).range(1..=20))]
    batch_size: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run a single cycle, print its report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "pagecast-send failed");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database_path().to_string_lossy()).await?;

    let batch_size = cli
        .batch_size
        .map(|n| n as usize)
        .unwrap_or(config.queue.batch_size);
    let poll_interval = cli.poll_interval.unwrap_or(config.queue.poll_interval_secs);
    if poll_interval == 0 {
        return Err(PagecastError::InvalidInput(
            "Poll interval must be at least 1 second".to_string(),
        ));
    }

    let processor = QueueProcessor::from_config(&config, db)?;

    if cli.once {
        let report = processor.run_cycle(batch_size).await?;
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| PagecastError::InvalidInput(format!("Failed to encode report: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    info!(batch_size, poll_interval, "pagecast-send starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    run_loop(&processor, batch_size, poll_interval, shutdown).await;

    info!("pagecast-send stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| PagecastError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping after current cycle");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

async fn run_loop(
    processor: &QueueProcessor,
    batch_size: usize,
    poll_interval: u64,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        // A failed cycle leaves its claims for the reclaim sweep
        match processor.run_cycle(batch_size).await {
            Ok(report) if report.processed > 0 => {
                info!(
                    processed = report.processed,
                    duration_ms = report.processing_time_ms,
                    "Cycle complete"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Processing cycle failed"),
        }

        // Sleep until the next cycle, checking for shutdown every second
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}
