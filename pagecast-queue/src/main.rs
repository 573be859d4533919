//! pagecast-queue - Inspect and repair the publish queue
//!
//! Operator tool over the queue: status counts, recent processing log,
//! failed items and manual recovery.

use std::time::Duration;

use clap::{Parser, Subcommand};
use libpagecast::admin::{
    AdminService, DEFAULT_FAILED_LIMIT, DEFAULT_LOG_LIMIT, DEFAULT_RETENTION, DEFAULT_STATS_WINDOW,
};
use libpagecast::db::{QueueLog, StatusCounts};
use libpagecast::logging::LoggingConfig;
use libpagecast::{Config, Database, PagecastError, QueueItem, Result};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "pagecast-queue")]
#[command(version)]
#[command(about = "Inspect and repair the publish queue")]
#[command(long_about = "\
pagecast-queue - Inspect and repair the publish queue

DESCRIPTION:
    pagecast-queue shows the health of the Pagecast publish queue and lets
    an operator recover failed or stuck items.

COMMANDS:
    status      Item counts per status within a time window
    errors      Recent entries of the processing log
    failed      Failed items that still have attempts left
    retry       Re-queue one failed item
    retry-all   Re-queue every retryable failed item
    reclaim     Return items stuck in processing to pending
    clear       Delete old completed items

USAGE EXAMPLES:
    # Counts for the last 24 hours
    pagecast-queue status

    # Counts for the last week as JSON
    pagecast-queue status --window 7d --format json

    # Re-queue a failed item
    pagecast-queue retry <QUEUE_ID>

    # Reclaim items claimed more than 15 minutes ago
    pagecast-queue reclaim --older-than 15m

CONFIGURATION:
    Configuration file: ~/.config/pagecast/config.toml
    Database location: ~/.local/share/pagecast/queue.db

    Override with environment variables:
        PAGECAST_CONFIG    - Path to config file
        PAGECAST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (unknown queue ID, bad duration or format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show item counts per status
    Status {
        /// Time window, e.g. "24h", "7d"
        #[arg(short, long, default_value = "24h")]
        window: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show recent processing log entries
    Errors {
        /// Number of entries to show
        #[arg(short, long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List failed items that can still be retried
    Failed {
        /// Number of items to show
        #[arg(short, long, default_value_t = DEFAULT_FAILED_LIMIT)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Re-queue a failed item
    Retry {
        /// Queue item ID
        queue_id: String,
    },

    /// Re-queue every retryable failed item
    RetryAll,

    /// Return items stuck in processing to pending
    Reclaim {
        /// Minimum time since the claim, e.g. "15m"
        #[arg(long, default_value = "15m")]
        older_than: String,
    },

    /// Delete completed items
    Clear {
        /// Minimum age of the completion, e.g. "7d"
        #[arg(long, default_value = "7d")]
        older_than: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(PagecastError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Quiet unless asked; stdout carries command output
    let mut logging = LoggingConfig::from_env(cli.verbose);
    if std::env::var("PAGECAST_LOG_LEVEL").is_err() {
        logging.level = "error".to_string();
    }
    logging.init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database_path().to_string_lossy()).await?;
    let admin = AdminService::new(db);

    match cli.command {
        Commands::Status { window, format } => {
            let window = parse_window(&window, DEFAULT_STATS_WINDOW)?;
            cmd_status(&admin, window, OutputFormat::parse(&format)?).await?;
        }
        Commands::Errors { limit, format } => {
            cmd_errors(&admin, limit, OutputFormat::parse(&format)?).await?;
        }
        Commands::Failed { limit, format } => {
            cmd_failed(&admin, limit, OutputFormat::parse(&format)?).await?;
        }
        Commands::Retry { queue_id } => {
            cmd_retry(&admin, &queue_id).await?;
        }
        Commands::RetryAll => {
            cmd_retry_all(&admin).await?;
        }
        Commands::Reclaim { older_than } => {
            let older_than = parse_window(&older_than, config.queue.stuck_timeout())?;
            let reclaimed = admin.reclaim_stuck(older_than).await?;
            println!("Reclaimed {} stuck item(s)", reclaimed);
        }
        Commands::Clear { older_than } => {
            let older_than = parse_window(&older_than, DEFAULT_RETENTION)?;
            let removed = admin.clear_completed(older_than).await?;
            println!("Removed {} completed item(s)", removed);
        }
    }

    Ok(())
}

/// Parse a human duration like "15m" or "7d"; empty input takes `default`
fn parse_window(input: &str, default: Duration) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(default);
    }
    humantime::parse_duration(input)
        .map_err(|e| PagecastError::InvalidInput(format!("Invalid duration '{}': {}", input, e)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| PagecastError::InvalidInput(format!("Failed to encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Show counts per status
async fn cmd_status(admin: &AdminService, window: Duration, format: OutputFormat) -> Result<()> {
    let counts = admin.stats(window).await?;

    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct StatusOutput<'a> {
                window_secs: u64,
                total: u64,
                #[serde(flatten)]
                counts: &'a StatusCounts,
            }
            print_json(&StatusOutput {
                window_secs: window.as_secs(),
                total: counts.total(),
                counts: &counts,
            })
        }
        OutputFormat::Text => {
            println!("Queue status (last {})", humantime::format_duration(window));
            println!();
            println!("  Pending:    {}", counts.pending);
            println!("  Processing: {}", counts.processing);
            println!("  Retrying:   {}", counts.retrying);
            println!("  Completed:  {}", counts.completed);
            println!("  Failed:     {}", counts.failed);
            println!();
            println!("  Total:      {}", counts.total());
            Ok(())
        }
    }
}

/// Show the processing log, newest first
async fn cmd_errors(admin: &AdminService, limit: usize, format: OutputFormat) -> Result<()> {
    let logs = admin.recent_logs(limit).await?;

    match format {
        OutputFormat::Json => print_json(&logs),
        OutputFormat::Text => {
            if logs.is_empty() {
                println!("No processing log entries");
                return Ok(());
            }
            for log in &logs {
                print_log_line(log);
            }
            Ok(())
        }
    }
}

fn print_log_line(log: &QueueLog) {
    let elapsed = log
        .processing_time_ms
        .map(|ms| format!(" ({}ms)", ms))
        .unwrap_or_default();
    println!(
        "{}  {:<10} {}{}",
        format_timestamp(log.created_at),
        log.status,
        log.queue_id,
        elapsed
    );
    if let Some(message) = &log.message {
        println!("    {}", message);
    }
}

/// List retryable failures
async fn cmd_failed(admin: &AdminService, limit: usize, format: OutputFormat) -> Result<()> {
    let items = admin.retryable_failures(limit).await?;

    match format {
        OutputFormat::Json => print_json(&items),
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No retryable failures");
                return Ok(());
            }
            for item in &items {
                print_failed_item(item);
            }
            Ok(())
        }
    }
}

fn print_failed_item(item: &QueueItem) {
    println!(
        "{}  post {}  attempts {}/{}",
        item.queue_id, item.post_id, item.attempts, item.max_attempts
    );
    if let Some(error) = &item.last_error {
        println!("    {}", error);
    }
}

async fn cmd_retry(admin: &AdminService, queue_id: &str) -> Result<()> {
    let item = admin.retry_item(queue_id).await?;
    println!("Re-queued {} (post {})", item.queue_id, item.post_id);
    Ok(())
}

async fn cmd_retry_all(admin: &AdminService) -> Result<()> {
    let report = admin.retry_all().await?;
    println!("Re-queued {} item(s)", report.requeued);
    for error in &report.errors {
        eprintln!("Skipped: {}", error);
    }
    Ok(())
}
