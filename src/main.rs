//! shardlog - Durable Logging and Replication for Sharded In-Memory Stores
//!
//! Runs one shard as primary, local hot standby or replica, and offers
//! tools to inspect log files and take snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardlog::config::ShardLogConfig;
use shardlog::error::{Error, Result};
use shardlog::network::quorum;
use shardlog::executor::MemoryExecutor;
use shardlog::recovery::Recovery;
use shardlog::replication::{FeederServer, FilterRegistry};
use shardlog::wal::tag;
use shardlog::wal::{LogFile, LogKind, Row};

/// shardlog - WAL, snapshots and replication for one shard
#[derive(Parser)]
#[command(name = "shardlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shardlog.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to [logging]
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover the shard and serve it until interrupted
    Start,

    /// Print the rows of a WAL or snapshot file
    Cat {
        /// File to print
        file: PathBuf,

        /// One JSON object per row
        #[arg(long)]
        json: bool,
    },

    /// Recover from local files and write a snapshot
    Snapshot,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shardlog.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Also create the data directory with an empty initial snapshot
        #[arg(long)]
        storage: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = ShardLogConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    let _log_guard = init_logging(&level, logging.file.as_deref());

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Cat { file, json } => run_cat(file, json),
        Commands::Snapshot => run_snapshot(cli.config),
        Commands::Init {
            output,
            node_id,
            storage,
        } => run_init(output, node_id, storage),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config).await,
    }
}

/// Initialize logging to stderr, and to `file` when one is configured.
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(level: &str, file: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let target = file.and_then(|path| Some((path.parent()?, path.file_name()?)));
    let (file_layer, guard) = match target {
        Some((dir, name)) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Cannot create log directory {}: {}", dir.display(), e);
            }
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

/// Recover the shard, then act as primary, local standby or replica
async fn run_start(config_path: PathBuf) -> Result<()> {
    let config = match ShardLogConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Starting shardlog node {}", config.node.id);

    if let Err(e) = config.paths().ensure_dirs() {
        tracing::error!(
            "Failed to create data directory {:?}: {}",
            config.node.data_dir,
            e
        );
        return Err(e.into());
    }

    let routing = Arc::new(config.routing_table()?);
    let mut recovery = Recovery::from_config(&config, MemoryExecutor::new())?
        .with_routing(routing, config.node.shard_id);
    let lsn = recovery.load_from_local()?;
    tracing::info!(
        "Recovered {} keys at LSN {}",
        recovery.executor().len(),
        lsn
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let feeder = match &config.node.feeder_bind_address {
        Some(addr) => {
            let server = Arc::new(
                FeederServer::bind(
                    addr,
                    config.wal_dir(),
                    config.snap_dir(),
                    FilterRegistry::new(),
                    config.rescan_delay(),
                )
                .await?,
            );
            tracing::info!("Feeding replicas on {}", server.local_addr()?);
            let runner = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = runner.run().await {
                    tracing::error!("Feeder error: {}", e);
                }
            });
            Some(server)
        }
        None => None,
    };

    let result = if recovery.is_replica() {
        recovery.remote_hot_standby(shutdown_rx).await
    } else if config.node.local_hot_standby || config.node.read_only {
        recovery
            .local_hot_standby(config.rescan_delay(), shutdown_rx)
            .await
    } else {
        run_primary(&mut recovery, &config, shutdown_rx).await
    };

    if let Some(feeder) = feeder {
        feeder.stop();
    }
    tracing::info!("Final status: {}", recovery.status());
    recovery.close()?;
    tracing::info!("shardlog shutdown complete");
    result
}

/// Primary duties: periodic snapshots and run_crc checkpoints
async fn run_primary(
    recovery: &mut Recovery<MemoryExecutor>,
    config: &ShardLogConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    recovery.enable_local_writes()?;

    let mut snapshot_ticker = ticker(config.snapshot.interval_secs);
    let mut run_crc_ticker = ticker(config.replication.run_crc_interval_secs);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = tick(&mut snapshot_ticker) => {
                if let Err(e) = recovery.snapshot(false) {
                    tracing::error!("Periodic snapshot failed: {}", e);
                }
            }
            _ = tick(&mut run_crc_ticker) => {
                match recovery.submit_run_crc().await {
                    Ok(rci) => tracing::debug!("run_crc checkpoint at SCN {}", rci.scn),
                    Err(e) if e.is_writer_failure() => {
                        tracing::error!("WAL writer failed: {}", e);
                        recovery.restart_writer()?;
                    }
                    Err(e) => tracing::warn!("run_crc checkpoint failed: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Interval ticking every `secs` seconds, or never for 0
fn ticker(secs: u64) -> Option<tokio::time::Interval> {
    (secs > 0).then(|| {
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.reset();
        interval
    })
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Print every row of a log file
fn run_cat(path: PathBuf, json: bool) -> Result<()> {
    let kind = if is_snapshot(&path) {
        LogKind::Snap
    } else {
        LogKind::Wal
    };

    let mut log = LogFile::open_for_read(kind, path)?;
    let mut rows = 0;
    while let Some(row) = log.next_row()? {
        if json {
            println!("{}", row_json(&row));
        } else {
            println!("{}", row);
        }
        rows += 1;
    }
    if !json {
        println!("-- {} rows, {} format, eof marker {}", rows, log.format().version(), log.eof());
    }
    Ok(())
}

fn is_snapshot(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.contains(".snap"))
}

fn row_json(row: &Row) -> serde_json::Value {
    let data: String = row.data.iter().map(|b| format!("{:02x}", b)).collect();
    serde_json::json!({
        "lsn": row.lsn,
        "scn": row.scn,
        "tag": tag::tag_to_str(row.tag),
        "cookie": row.cookie,
        "tm": row.tm,
        "len": row.len(),
        "data": data,
    })
}

/// Recover from local files and snapshot the result
fn run_snapshot(config_path: PathBuf) -> Result<()> {
    let config = ShardLogConfig::from_file(&config_path)?;
    let mut recovery = Recovery::from_config(&config, MemoryExecutor::new())?;
    let lsn = recovery.load_from_local()?;
    let path = recovery.snapshot(true)?;
    println!("Snapshot at LSN {} written to {}", lsn, path.display());
    recovery.close()?;
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String, storage: bool) -> Result<()> {
    let data_dir = format!("/var/lib/shardlog/{node_id}");
    let config_content = format!(
        r#"# shardlog Configuration
# Generated configuration file

[node]
id = "{node_id}"
data_dir = "{data_dir}"
# feeder_bind_address = "0.0.0.0:33034"
read_only = false
local_hot_standby = false

[wal]
rows_per_file = 50000
fsync = true
pack_max_rows = 1024
rescan_delay_ms = 100

[snapshot]
fsync = true
interval_secs = 3600

[replication]
# feeder_addr = "primary"
# filter_name = "even_keys"
filter_type = "id"
version = 2
reconnect_delay_ms = 1000
panic_on_scn_gap = false
run_crc_interval_secs = 60

[replication.peers]
# primary = "10.0.0.1:33034"

[logging]
level = "info"
# file = "/var/log/shardlog/shardlog.log"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());

    if storage {
        let config = ShardLogConfig::from_file(&output)?;
        config.paths().ensure_dirs()?;
        let mut recovery = Recovery::from_config(&config, MemoryExecutor::new())?;
        let path = recovery.write_initial_state()?;
        println!("Initial snapshot written to {}", path.display());
    }

    println!("Then start with: shardlog start --config {}", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ShardLogConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Data Directory: {}", config.node.data_dir.display());
            match config.feeder_param() {
                Ok(Some(feeder)) => println!("  Replica of: {}", feeder),
                _ => println!("  Replica of: (none)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
async fn run_info(config_path: PathBuf) -> Result<()> {
    let config = ShardLogConfig::from_file(&config_path)?;

    println!("shardlog Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!(
        "Feeder:           {}",
        config.node.feeder_bind_address.as_deref().unwrap_or("(disabled)")
    );
    println!();
    println!("WAL Configuration:");
    println!("  Rows per File:  {}", config.wal.rows_per_file);
    println!("  Pack Rows:      {}", config.wal.pack_max_rows);
    println!("  Fsync:          {}", config.wal.fsync);
    println!();
    println!("Replication:");
    match config.feeder_param() {
        Ok(Some(feeder)) => println!("  Feeder:         {}", feeder),
        _ => println!("  Feeder:         (none)"),
    }
    println!("  Peers:          {:?}", config.replication.peers);
    println!(
        "  SCN Gaps:       {}",
        if config.replication.panic_on_scn_gap {
            "refused"
        } else {
            "warned"
        }
    );
    print_peer_quorum(&config).await;

    // position on disk, when the data directory is readable
    let mut recovery = Recovery::from_config(&config, MemoryExecutor::new())?;
    match recovery.load_from_local() {
        Ok(_) => {
            let info = recovery.info();
            println!();
            println!("Local State:");
            println!("  LSN:            {}", info.lsn);
            println!("  SCN:            {}", info.scn);
            println!("  Run CRC:        {:#010x}", info.run_crc_log);
            println!("  Keys:           {}", recovery.executor().len());
        }
        Err(e) => println!("\nLocal State:      unavailable ({})", e),
    }
    Ok(())
}

/// Connect to every named peer and report whether a majority accepts
/// connections
async fn print_peer_quorum(config: &ShardLogConfig) {
    let peers: Vec<_> = config
        .replication
        .peers
        .keys()
        .filter_map(|name| config.resolve_addr(name).map(|addr| (name.as_str(), addr)))
        .collect();
    if peers.is_empty() {
        return;
    }

    let required = peers.len() / 2 + 1;
    let attempts = peers.iter().map(|(name, addr)| async move {
        tokio::net::TcpStream::connect(addr)
            .await
            .map(|_| *name)
            .map_err(Error::from)
    });
    let replies = quorum::broadcast(attempts, required, Duration::from_secs(2)).await;
    let answered = replies.replies.join(", ");
    match replies.into_result() {
        Ok(_) => println!("  Peer Quorum:    reached ({})", answered),
        Err(e) => println!("  Peer Quorum:    {}", e),
    }
}
