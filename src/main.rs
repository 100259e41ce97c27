//! selftop CLI
//!
//! Personal activity telemetry daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use selftop::{
    collector::Subscriber,
    config::Config,
    core::SessionAggregator,
    stats::{create_shared_log_with_persistence, IngestStats},
    store::{SqliteStore, CURRENT_SCHEMA_VERSION},
    VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "selftop")]
#[command(version = VERSION)]
#[command(about = "Personal activity telemetry daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume events from the capture agent and record sessions
    Run {
        /// Capture agent publisher url (tcp://host:port)
        #[arg(long)]
        source: Option<String>,

        /// Database file
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Create or migrate the database
    InitDb {
        /// Database file
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Show configuration and cumulative statistics
    Status,

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { source, database } => cmd_run(source, database),
        Commands::InitDb { database } => cmd_init_db(database),
        Commands::Status => cmd_status(),
        Commands::Config { init } => cmd_config(init),
    };

    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("selftop=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_run(source: Option<String>, database: Option<PathBuf>) -> Result<()> {
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(url) = source {
        config.source_url = url;
    }
    if let Some(path) = database {
        config.database_path = path;
    }
    config
        .ensure_directories()
        .context("failed to create data directories")?;

    tracing::info!(
        version = VERSION,
        source = %config.source_url,
        database = %config.database_path.display(),
        idle_timeout_ms = config.idle_timeout_ms,
        "starting selftop"
    );

    let store = SqliteStore::open(&config.database_path).context("failed to open database")?;
    let mut aggregator = SessionAggregator::new(store, config.aggregator());
    let ingest_log = create_shared_log_with_persistence(config.stats_path());

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;

    let mut subscriber = Subscriber::new(config.subscriber());
    subscriber
        .start()
        .context("failed to subscribe to capture agent")?;
    let receiver = subscriber.receiver().clone();

    // One event at a time: any commit it triggers finishes before the next
    // event is read.
    let outcome = loop {
        if !running.load(Ordering::SeqCst) {
            tracing::info!("interrupted, shutting down");
            break Ok(());
        }

        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                ingest_log.record_event(event.event_type);
                match aggregator.process(event) {
                    Ok(Some(closed)) => ingest_log.record_session(&closed),
                    Ok(None) => {}
                    Err(e) => break Err(e),
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("capture agent stream ended");
                break Ok(());
            }
        }
    };

    let source = subscriber.stop();
    ingest_log.record_undecodable(subscriber.undecodable_count());

    if let Some(open) = aggregator.discard() {
        tracing::info!(
            class = %open.previous.window.class,
            active_ms = open.counter.time,
            motions = open.counter.motions,
            keys = open.counter.keys,
            "open session is not persisted"
        );
    }

    if let Err(e) = ingest_log.save() {
        tracing::warn!("could not save ingest stats: {e}");
    }
    println!("{}", ingest_log.summary());

    outcome.context("session aggregation failed")?;
    source.context("capture agent stream failed")
}

fn cmd_init_db(database: Option<PathBuf>) -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let path = database.unwrap_or(config.database_path);

    let store = SqliteStore::open(&path).context("failed to open database")?;
    let counts = store.row_counts()?;

    println!("Database ready at {}", path.display());
    println!("  Schema version: {CURRENT_SCHEMA_VERSION}");
    println!("  Windows: {}", counts.windows);
    println!("  Sessions: {}", counts.sessions);
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    println!("selftop Status");
    println!("==============");
    println!();

    println!("Configuration:");
    println!("  Source: {}", config.source_url);
    println!("  Database: {}", config.database_path.display());
    println!("  Idle timeout: {}s", config.idle_timeout_ms / 1000);
    println!("  Motion filter: {}ms", config.motion_filter_ms);
    println!("  Identity lookup: {:?}", config.identity_lookup);
    println!();

    if config.database_path.exists() {
        let store = SqliteStore::open(&config.database_path).context("failed to open database")?;
        let counts = store.row_counts()?;
        println!("Database:");
        println!("  Processes: {}", counts.processes);
        println!("  Windows: {}", counts.windows);
        println!("  Sessions: {}", counts.sessions);
        println!("  Key events: {}", counts.key_events);
        println!();
    } else {
        println!("No database found. Run `selftop init-db` or `selftop run`.");
        println!();
    }

    let stats_path = config.stats_path();
    match IngestStats::load_persisted(&stats_path) {
        Ok(stats) => {
            println!("Cumulative Statistics:");
            println!("  Events consumed: {}", stats.total_events());
            println!("  Undecodable messages: {}", stats.undecodable_messages);
            println!("  Sessions committed: {}", stats.sessions_committed);
            println!("  Key events persisted: {}", stats.keys_persisted);
            println!("  Last updated: {}", stats.run_start.format("%Y-%m-%d %H:%M:%S"));
        }
        Err(_) => println!("No previous run statistics found."),
    }

    Ok(())
}

fn cmd_config(init: bool) -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    if init {
        config.save().context("failed to save configuration")?;
        println!("Configuration written to {}", Config::config_path().display());
        return Ok(());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")
}
