use clap::{Parser, Subcommand};
use fleetsync::config::{SyncConfig, APP_NAME};
use fleetsync::remote::HttpRemote;
use fleetsync::store::{CacheStore, LocalStore};
use fleetsync::subscriptions::StaticAuth;
use fleetsync::{SyncService, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleetsync")]
#[command(about = "Inspect and maintain the fleetsync offline store", long_about = None)]
struct Args {
    /// Directory containing fleetsync.toml and an optional .env
    #[arg(long, global = true, default_value = ".")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show cache and pending queue statistics
    Stats,

    /// Delete expired cache entries
    Sweep,

    /// Inspect or clear the pending write queue
    Pending {
        #[command(subcommand)]
        command: PendingCommand,
    },

    /// Drop every cached query result of a collection
    Invalidate {
        /// Collection path, e.g. "trips"
        collection: String,
    },

    /// Replay the pending queue against the configured remote store
    Drain,
}

#[derive(Subcommand, Debug)]
enum PendingCommand {
    /// List queued operations, oldest first
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete every queued operation
    Clear,
}

fn open_store(config: &SyncConfig) -> anyhow::Result<CacheStore> {
    let clock = Arc::new(SystemClock);
    let local = match &config.store.path {
        Some(path) => LocalStore::open(path, clock)?,
        None => LocalStore::open_default(APP_NAME, clock)?,
    };
    Ok(CacheStore::new(
        local.with_queue_config(config.store.queue_config()),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::load(&args.config)?;

    match args.command {
        Command::Stats => {
            let store = open_store(&config)?;
            let cache = store.cache_stats().await?;
            let queue = store.queue_stats().await?;
            let last_drain = store.get_metadata("last_drain_at").await?;

            println!("Cache entries:   {} ({} expired)", cache.entries, cache.expired);
            println!("Cache size:      {} bytes", cache.bytes);
            println!(
                "Pending writes:  {} ({} bytes, limit {})",
                queue.count, queue.bytes, config.store.queue_max_count
            );
            match last_drain.and_then(|ms| ms.parse::<i64>().ok()) {
                Some(ms) => match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms) {
                    Some(at) => println!("Last drain:      {}", at.to_rfc3339()),
                    None => println!("Last drain:      {}", ms),
                },
                None => println!("Last drain:      never"),
            }
        }

        Command::Sweep => {
            let store = open_store(&config)?;
            let removed = store.sweep_expired().await?;
            println!("Removed {} expired cache entries", removed);
        }

        Command::Pending { command } => {
            let store = open_store(&config)?;
            match command {
                PendingCommand::List { json } => {
                    let operations = store.pending_operations().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&operations)?);
                    } else if operations.is_empty() {
                        println!("No pending operations");
                    } else {
                        for op in operations {
                            println!(
                                "#{:<6} {:<7} {}/{} (attempts: {})",
                                op.id,
                                op.operation_type,
                                op.collection_path,
                                op.doc_id.as_deref().unwrap_or("-"),
                                op.attempts
                            );
                        }
                    }
                }
                PendingCommand::Clear => {
                    let removed = store.clear_pending().await?;
                    println!("Removed {} pending operations", removed);
                }
            }
        }

        Command::Invalidate { collection } => {
            let store = open_store(&config)?;
            let removed = store.invalidate_collection(&collection).await?;
            println!("Removed {} cache entries for {}", removed, collection);
        }

        Command::Drain => {
            let Some(url) = config.remote.url.clone() else {
                anyhow::bail!(
                    "No remote configured. Set [remote] url in {} or FLEETSYNC_REMOTE_URL.",
                    fleetsync::config::CONFIG_FILE_NAME
                );
            };

            let mut remote = HttpRemote::new(&url, &config.remote.database)?
                .with_poll_interval(config.remote.poll_interval());
            if let Some(api_key) = &config.remote.api_key {
                remote = remote.with_api_key(api_key);
            }

            let mut sync_config = config.clone();
            sync_config.sync.drain_on_start = false;
            let service = SyncService::open(
                sync_config,
                Arc::new(remote),
                Arc::new(StaticAuth::new(true)),
            )?;
            service.monitor().init().await;

            match service.coordinator().drain().await? {
                Some(report) => println!(
                    "Applied {}, retained {}, discarded {}",
                    report.succeeded, report.failed, report.discarded
                ),
                None => println!("A drain is already running"),
            }
            service.dispose();
        }
    }

    Ok(())
}
