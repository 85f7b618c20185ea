//! dorsync - synchronization and transaction-log tool for DOR repositories.
//!
//! Supports:
//! - Writing a sync configuration (pull and push queries)
//! - One-shot or periodic sync between a local and a remote backend
//! - Scanning and migrating transaction logs
//!
//! # Usage
//!
//! ```bash
//! # Write a sync configuration
//! dorsync config-init sync.json --pull docs=objatt_type:doc --sync-all-changes
//!
//! # One sync pass
//! dorsync sync --local local.json --remote remote.json --config sync.json
//!
//! # Sync every interval until Ctrl-C
//! dorsync sync --local local.json --remote remote.json --config sync.json --interval
//!
//! # Print a transaction log
//! dorsync txnlog scan ./txnlog --since 1700000000000
//!
//! # Move a flat-file log into the ordered KV log
//! dorsync txnlog migrate ./txnlog
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use dor_core::txnlog::{migrate_flat_file_log, migration_needed};
use dor_core::{
    BackendConfig, FileTransactionQueue, KvTransactionQueue, Query, SyncIntervalManager, SyncingConfig,
    SyncingRepository, TransactionQueue,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dorsync")]
#[command(author = "DOR Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DOR repository synchronization tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a sync configuration file
    #[command(name = "config-init")]
    ConfigInit {
        /// Configuration file to write
        file: PathBuf,
        /// Push every locally modified object
        #[arg(long)]
        sync_all_changes: bool,
        /// Pull query as name=query (repeatable)
        #[arg(long = "pull", value_name = "NAME=QUERY")]
        pulls: Vec<String>,
        /// Push query as name=query (repeatable)
        #[arg(long = "push", value_name = "NAME=QUERY")]
        pushes: Vec<String>,
        /// Seconds between periodic passes
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Synchronize a local backend with a remote one
    Sync {
        /// Local backend configuration (JSON)
        #[arg(short, long)]
        local: PathBuf,
        /// Remote backend configuration (JSON)
        #[arg(short, long)]
        remote: PathBuf,
        /// Sync configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Keep syncing every configured interval until Ctrl-C
        #[arg(long)]
        interval: bool,
    },

    /// Transaction log tools
    Txnlog {
        #[command(subcommand)]
        command: TxnlogCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TxnlogCommands {
    /// Print transactions, oldest first
    Scan {
        /// Log directory
        dir: PathBuf,
        /// Only transactions after this timestamp (ms)
        #[arg(long, default_value_t = 0)]
        since: i64,
        /// Read an ordered KV log instead of a flat-file log
        #[arg(long)]
        kv: bool,
    },

    /// Migrate a flat-file log into the ordered KV log
    Migrate {
        /// Log directory
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::ConfigInit {
            file,
            sync_all_changes,
            pulls,
            pushes,
            interval_secs,
        } => {
            let config = cmd_config_init(&file, sync_all_changes, &pulls, &pushes, interval_secs)?;
            println!("Wrote sync configuration to {}:", file.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Sync {
            local,
            remote,
            config,
            interval,
        } => cmd_sync(&local, &remote, &config, interval)?,
        Commands::Txnlog { command } => match command {
            TxnlogCommands::Scan { dir, since, kv } => cmd_txnlog_scan(&dir, since, kv)?,
            TxnlogCommands::Migrate { dir } => cmd_txnlog_migrate(&dir)?,
        },
    }

    Ok(())
}

/// Split `name=query` and parse the query's textual form
fn parse_named_query(arg: &str) -> Result<(String, Query)> {
    let (name, text) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=QUERY, got '{}'", arg))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("query name is empty in '{}'", arg));
    }
    Ok((name.to_string(), Query::parse(text.trim())))
}

fn cmd_config_init(
    file: &Path,
    sync_all_changes: bool,
    pulls: &[String],
    pushes: &[String],
    interval_secs: Option<u64>,
) -> Result<SyncingConfig> {
    let mut config = SyncingConfig::default();
    for arg in pulls {
        let (name, query) = parse_named_query(arg)?;
        config.add_pull_query(name, query);
    }
    for arg in pushes {
        let (name, query) = parse_named_query(arg)?;
        config.add_push_query(name, query);
    }
    config.set_sync_all_changes(sync_all_changes);
    if let Some(secs) = interval_secs {
        config.interval_secs = secs;
    }
    config
        .save(file)
        .with_context(|| format!("Failed to write {}", file.display()))?;
    Ok(config)
}

fn open_backend(path: &Path) -> Result<dor_core::SharedRepository> {
    let config =
        BackendConfig::load(path).with_context(|| format!("Failed to read backend config {}", path.display()))?;
    info!("Opening {} backend from {}", config.kind(), path.display());
    config
        .open()
        .with_context(|| format!("Failed to open backend {}", path.display()))
}

fn cmd_sync(local: &Path, remote: &Path, config_path: &Path, interval: bool) -> Result<()> {
    let config = SyncingConfig::load(config_path)
        .with_context(|| format!("Failed to read sync config {}", config_path.display()))?;
    if config.pull_queries.is_empty() && config.push_queries.is_empty() {
        println!("No pull or push queries configured; nothing to do.");
        return Ok(());
    }

    // Backends are opened and closed off the runtime; the REST backend uses a blocking client
    let local_repo = open_backend(local)?;
    let remote_repo = open_backend(remote)?;
    let repo = Arc::new(
        SyncingRepository::new(local_repo.clone(), remote_repo.clone(), config)
            .context("Failed to set up syncing repository")?,
    );

    if interval {
        let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
        let manager = SyncIntervalManager::from_config(repo.clone());
        println!("Syncing every {}s, press Ctrl-C to stop", manager.period().as_secs());
        runtime.block_on(async {
            manager.start();
            tokio::signal::ctrl_c().await
        })?;
        manager.stop();
        runtime.shutdown_timeout(Duration::from_secs(30));
        info!("Stopped periodic sync");
    } else {
        let report = repo.sync_now().context("Sync failed")?;
        println!("Sync complete:");
        println!("  Pulled:          {}", report.pulled);
        println!("  Pushed:          {}", report.pushed);
        println!("  Deleted locally: {}", report.deleted_locally);
        println!("  Remote high-water mark: {}", repo.greatest_modified_from_remote()?);
    }

    drop(repo);
    local_repo.close().context("Failed to close local backend")?;
    remote_repo.close().context("Failed to close remote backend")?;
    Ok(())
}

fn cmd_txnlog_scan(dir: &Path, since: i64, kv: bool) -> Result<()> {
    let queue: Box<dyn TransactionQueue> = if kv {
        Box::new(KvTransactionQueue::open(dir).with_context(|| format!("Failed to open {}", dir.display()))?)
    } else {
        Box::new(FileTransactionQueue::open(dir).with_context(|| format!("Failed to open {}", dir.display()))?)
    };

    let mut count = 0u64;
    for txn in queue.scanner(since)? {
        println!("{}", txn?);
        count += 1;
    }
    queue.shutdown()?;
    eprintln!("{} transaction(s), last timestamp {}", count, queue.last_timestamp());
    Ok(())
}

fn cmd_txnlog_migrate(dir: &Path) -> Result<()> {
    if !migration_needed(dir)? {
        println!("No flat-file log found in {}; nothing to migrate.", dir.display());
        return Ok(());
    }
    let copied = migrate_flat_file_log(dir).with_context(|| format!("Failed to migrate {}", dir.display()))?;
    println!("Migrated {} transaction(s)", copied);
    println!("  Flat-file log kept at {}.old", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_named_query() {
        let (name, query) = parse_named_query("docs=objatt_type:doc").unwrap();
        assert_eq!(name, "docs");
        assert_eq!(query, Query::attribute("type", "doc"));

        assert!(parse_named_query("no-equals").is_err());
        assert!(parse_named_query("=objatt_a:1").is_err());
    }

    #[test]
    fn test_config_init_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("sync.json");
        let pulls = vec!["docs=objatt_type:doc".to_string()];
        let pushes = vec!["notes=objatt_type:note".to_string()];

        let written = cmd_config_init(&file, true, &pulls, &pushes, Some(60)).unwrap();
        let loaded = SyncingConfig::load(&file).unwrap();
        assert_eq!(loaded, written);
        assert_eq!(loaded.interval_secs, 60);
        assert!(loaded.sync_all_changes);
        assert_eq!(loaded.pull_queries["docs"], Query::attribute("type", "doc"));
        // notes plus the sync-all marker query
        assert_eq!(loaded.push_queries.len(), 2);
    }
}
