//! Snapkeep - Main entry point
//!
//! Watches a file and archives every real change, or operates on the archive
//! (list, restore, delete) from the command line.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use snapkeep_agent::config::LogConfig;
use snapkeep_agent::daemon::shutdown::ShutdownCoordinator;
use snapkeep_agent::utils::{self, format};
use snapkeep_agent::{
    BackupStore, CaptureOutcome, Config, MonitorConfig, MonitorController, MonitorEvent,
    SessionState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// File to watch (overrides config)
    #[arg(short, long, value_name = "FILE", global = true)]
    source: Option<PathBuf>,

    /// Archive directory (overrides config)
    #[arg(short, long, value_name = "DIR", global = true)]
    archive: Option<PathBuf>,

    /// Number of backups to keep (overrides config)
    #[arg(long, global = true)]
    max_backups: Option<usize>,

    /// Poll interval in milliseconds (overrides config)
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the file until SIGINT/SIGTERM (default)
    Watch,
    /// Capture the file once and apply the retention limit
    Backup,
    /// List backups, newest first
    List {
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Restore a backup over the watched file, or to another path
    Restore {
        id: String,
        #[arg(long, value_name = "PATH")]
        to: Option<PathBuf>,
    },
    /// Delete a backup and its archived copy
    Delete { id: String },
    /// Attach an external asset reference (e.g. a screenshot) to a backup
    Attach { id: String, asset: String },
    /// Remove archive files that no backup references
    Gc,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    let command = args.command.take().unwrap_or(Command::Watch);

    let config = resolve_config(&args)?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let monitor = config.monitor;
    match command {
        Command::Watch => watch(&monitor).await,
        Command::Backup => backup_once(&monitor).await,
        Command::List { json } => list(&monitor, json).await,
        Command::Restore { id, to } => {
            let target = match to {
                Some(path) => absolutize(path)?,
                None => monitor.source_path.clone(),
            };
            restore(&monitor, &id, &target).await
        }
        Command::Delete { id } => delete(&monitor, &id).await,
        Command::Attach { id, asset } => attach(&monitor, &id, &asset).await,
        Command::Gc => gc(&monitor).await,
    }
}

/// Config file (if any), then command-line overrides, then validation
fn resolve_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let source = args
                .source
                .clone()
                .ok_or_else(|| anyhow!("--source is required when no --config is given"))?;
            let archive = args
                .archive
                .clone()
                .ok_or_else(|| anyhow!("--archive is required when no --config is given"))?;
            Config {
                monitor: MonitorConfig::new(source, archive),
                log: LogConfig::default(),
            }
        }
    };

    if let Some(source) = &args.source {
        config.monitor.source_path = source.clone();
    }
    if let Some(archive) = &args.archive {
        config.monitor.archive_path = archive.clone();
    }
    if let Some(max_backups) = args.max_backups {
        config.monitor.max_backups = max_backups;
    }
    if let Some(poll_interval_ms) = args.poll_interval_ms {
        config.monitor.poll_interval_ms = poll_interval_ms;
    }

    config.monitor.source_path = absolutize(config.monitor.source_path)?;
    config.monitor.archive_path = absolutize(config.monitor.archive_path)?;
    config.monitor.validate()?;
    Ok(config)
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

async fn open_store(config: &MonitorConfig) -> Result<BackupStore> {
    Ok(BackupStore::open(&config.archive_path, config.duplicate_policy).await?)
}

async fn watch(config: &MonitorConfig) -> Result<()> {
    info!("Starting snapkeep v{}", env!("CARGO_PKG_VERSION"));

    let controller = MonitorController::open(config).await?;
    let mut events = controller.subscribe();
    let mut lifecycle = controller.subscribe();

    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event log fell behind, skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    controller.start(config).await?;

    let session_ended = async {
        loop {
            match lifecycle.recv().await {
                Ok(MonitorEvent::Stopped) | Err(RecvError::Closed) => break,
                _ => {}
            }
        }
    };

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let mut shutdown_rx = shutdown.subscribe();
    let signal_listener = tokio::spawn({
        let shutdown = Arc::clone(&shutdown);
        async move { shutdown.wait_for_signal().await }
    });

    tokio::select! {
        _ = shutdown_rx.recv() => {}
        _ = session_ended => {}
    }
    signal_listener.abort();

    if tokio::time::timeout(Duration::from_secs(10), controller.stop()).await.is_err() {
        warn!("Monitor stop timed out, forcing exit");
    }
    let status = controller.status().await;
    event_log.abort();

    match status.state {
        SessionState::Failed(reason) => Err(anyhow!("monitor session failed: {}", reason)),
        _ => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::Started { path } => info!("Watching {}", path.display()),
        MonitorEvent::Changed { path } => debug!("Change detected in {}", path.display()),
        MonitorEvent::BackupCreated(record) => info!(
            record_id = %record.id,
            "Backup {} ({})",
            record.archive_file_name,
            format::format_bytes(record.size_bytes)
        ),
        MonitorEvent::Error { kind, message } => warn!(kind = ?kind, "{}", message),
        MonitorEvent::Stopped => info!("Monitor stopped"),
    }
}

async fn backup_once(config: &MonitorConfig) -> Result<()> {
    let store = open_store(config).await?;

    match store.create(&config.source_path).await? {
        CaptureOutcome::Created(record) => {
            println!("Created backup {} ({})", record.id, record.archive_file_name)
        }
        CaptureOutcome::Duplicate(record) => println!("Unchanged since backup {}", record.id),
        CaptureOutcome::SkippedEmpty => {
            println!("{} is empty, nothing to back up", config.source_path.display())
        }
    }

    let evicted = store.evict_overflow(config.max_backups).await?;
    if !evicted.is_empty() {
        println!("Evicted {} old backup(s)", evicted.len());
    }
    Ok(())
}

async fn list(config: &MonitorConfig, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let records = store.list().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No backups in {}", store.archive_dir().display());
        return Ok(());
    }

    println!("{:<36}  {:<19}  {:>10}  {:<12}  ASSET", "ID", "CREATED", "SIZE", "HASH");
    for record in &records {
        let missing = if store.archive_file_path(record).exists() { "" } else { " (missing)" };
        println!(
            "{:<36}  {:<19}  {:>10}  {:<12}  {}{}",
            record.id,
            format::format_timestamp(&record.created_at),
            format::format_bytes(record.size_bytes),
            format::short_digest(&record.content_digest),
            record.supplementary_asset.as_deref().unwrap_or("-"),
            missing
        );
    }
    Ok(())
}

async fn restore(config: &MonitorConfig, id: &str, target: &Path) -> Result<()> {
    let store = open_store(config).await?;
    let record = store.restore(id, target).await?;
    println!(
        "Restored {} ({}) to {}",
        record.id,
        format::format_timestamp(&record.created_at),
        target.display()
    );
    Ok(())
}

async fn delete(config: &MonitorConfig, id: &str) -> Result<()> {
    let store = open_store(config).await?;
    if store.delete(id).await? {
        println!("Deleted backup {}", id);
    } else {
        println!("No backup with id {}", id);
    }
    Ok(())
}

async fn attach(config: &MonitorConfig, id: &str, asset: &str) -> Result<()> {
    let store = open_store(config).await?;
    if store.attach_supplementary_asset(id, asset).await {
        println!("Attached {} to backup {}", asset, id);
    } else {
        println!("Could not attach {} to backup {}", asset, id);
    }
    Ok(())
}

async fn gc(config: &MonitorConfig) -> Result<()> {
    let store = open_store(config).await?;
    let removed = store.collect_orphans().await?;
    println!("Removed {} orphaned file(s)", removed);
    Ok(())
}
