//! tally - CLI for the durable analytics event queue
//!
//! This tool provides commands for:
//! - Checking configuration and the number of stored events
//! - Listing events waiting for delivery
//! - Logging a single event and waiting for it to be delivered
//! - Flushing events left over from earlier runs
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/tally/events.db (~/.local/share/tally/events.db)
//! - Config: $XDG_CONFIG_HOME/tally/config.toml (~/.config/tally/config.toml)

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tally_core::store::StoredEvent;
use tally_core::{Config, EventStore, Params, SdkKey, SqliteStore, Tracker};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Durable, ordered analytics event delivery")]
#[command(version)]
struct Args {
    /// Write debug logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and queue status
    Status,

    /// List events waiting for delivery
    Pending {
        /// Maximum number of events to list
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Log one event and wait for it to be delivered
    Send {
        /// Event name
        #[arg(value_parser = parse_name)]
        name: String,

        /// Event parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Raw body to deliver with the event
        #[arg(long)]
        post_data: Option<String>,

        /// Seconds to wait for delivery
        #[arg(short, long, default_value_t = 10)]
        wait_secs: u64,
    },

    /// Deliver events stored by earlier runs
    Flush {
        /// Seconds to wait for the queue to empty
        #[arg(short, long, default_value_t = 30)]
        wait_secs: u64,
    },
}

fn parse_name(raw: &str) -> std::result::Result<String, String> {
    tally_core::tracker::check_event_name(raw)
        .map(|_| raw.to_string())
        .map_err(|e| e.to_string())
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = if args.verbose {
        let mut logging = config.logging.clone();
        logging.level = "debug".to_string();
        Some(tally_core::logging::init(&logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Pending { limit, json } => cmd_pending(limit, json),
        Command::Send {
            name,
            params,
            post_data,
            wait_secs,
        } => cmd_send(&config, &name, params.into_iter().collect(), post_data, wait_secs).await,
        Command::Flush { wait_secs } => cmd_flush(&config, wait_secs).await,
    }
}

fn open_store() -> Result<Option<SqliteStore>> {
    let db_path = Config::database_path();
    if !db_path.exists() {
        return Ok(None);
    }

    let store = SqliteStore::open(&db_path).context("failed to open database")?;
    store
        .run_migrations()
        .context("failed to run database migrations")?;
    Ok(Some(store))
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Tally Configuration");
    println!("===================");
    println!();

    let config_path = Config::config_path();
    println!(
        "Config:          {}{}",
        config_path.display(),
        if config_path.exists() { "" } else { " (not found, using defaults)" }
    );
    println!("Database:        {}", Config::database_path().display());
    println!("Log:             {}", Config::log_path().display());
    println!();

    let key = config
        .app
        .sdk_key
        .as_deref()
        .map(SdkKey::parse)
        .transpose();
    match &key {
        Ok(Some(key)) => println!("Public Key:      {}", key.public_key()),
        Ok(None) => println!("Public Key:      (not set)"),
        Err(_) => println!("Public Key:      (invalid)"),
    }
    println!("Bundle ID:       {}", config.app.bundle_id);
    println!("App Version:     {}", config.app.app_version);
    println!("Endpoint:        {}", config.collector.endpoint);
    println!("Timeout:         {}s", config.collector.timeout_secs);
    println!(
        "Backoff:         {}ms .. {}ms",
        config.collector.initial_delay_ms, config.collector.max_delay_ms
    );

    println!();
    match open_store()? {
        Some(store) => {
            println!("Schema Version:  {}", store.schema_version()?);
            println!("Pending Events:  {}", store.pending_count()?);
        }
        None => println!("Pending Events:  0 (no database yet)"),
    }

    println!();
    match config.app.validate().and_then(|_| config.collector.validate()) {
        Ok(()) => println!("Status: Ready to deliver"),
        Err(e) => println!("Status: Not ready ({})", e),
    }

    Ok(())
}

fn cmd_pending(limit: usize, json: bool) -> Result<()> {
    let events = match open_store()? {
        Some(store) => store.list_pending(limit)?,
        None => Vec::new(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("No pending events.");
        return Ok(());
    }

    for event in &events {
        print_event(event);
    }
    Ok(())
}

fn print_event(event: &StoredEvent) {
    let logged_at = chrono::DateTime::from_timestamp_millis(event.timestamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| event.timestamp.to_string());
    let params = event
        .params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ");

    println!(
        "{:>6}  {}  {}{}{}",
        event.id,
        logged_at,
        event.name,
        if params.is_empty() { String::new() } else { format!("  {}", params) },
        if event.has_post_data { "  [body]" } else { "" }
    );
}

fn start_tracker(config: &Config) -> Result<Tracker> {
    let tracker = Tracker::new();
    tracker
        .start(config)
        .context("failed to start tracker (is app.sdk_key set?)")?;
    Ok(tracker)
}

async fn cmd_send(
    config: &Config,
    name: &str,
    params: Params,
    post_data: Option<String>,
    wait_secs: u64,
) -> Result<()> {
    let tracker = start_tracker(config)?;
    tracing::info!(event = name, params = params.len(), "Sending event from CLI");
    tracker.log_event(name, params, post_data);

    let status = tracker.drain(Duration::from_secs(wait_secs)).await;
    tracker.shutdown().await;

    match status {
        Some(status) if status.is_idle() => {
            println!("Delivered {} event(s)", status.delivered);
            Ok(())
        }
        Some(status) => bail!(
            "{} event(s) still pending after {}s; they will be retried on the next run",
            status.pending,
            wait_secs
        ),
        None => bail!("delivery queue stopped unexpectedly"),
    }
}

async fn cmd_flush(config: &Config, wait_secs: u64) -> Result<()> {
    let pending = match open_store()? {
        Some(store) => store.pending_count()?,
        None => 0,
    };
    if pending == 0 {
        println!("No pending events to flush.");
        return Ok(());
    }

    println!("Flushing {} pending event(s)...", pending);
    tracing::info!(pending, wait_secs, "Flushing stored events");
    let tracker = start_tracker(config)?;
    let status = tracker.drain(Duration::from_secs(wait_secs)).await;
    tracker.shutdown().await;

    match status {
        Some(status) => {
            println!("Delivered {} event(s)", status.delivered);
            if status.pending > 0 {
                println!("{} event(s) still pending", status.pending);
            }
            Ok(())
        }
        None => bail!("delivery queue stopped unexpectedly"),
    }
}
