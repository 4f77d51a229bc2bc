//! RecallDB command-line interface
//!
//! Operator tool for inspecting and exercising a memory store:
//! - Store and read values
//! - Show entry metadata and performance counters
//! - Purge expired entries
//! - Run a concurrent load generator
//!
//! # Examples
//!
//! ```bash
//! # Store a value (JSON, or a plain string)
//! recalldb put user:name '"Ada"' --type profile --ttl 3600
//!
//! # Read it back
//! recalldb get user:name
//!
//! # 16 tasks, 500 store/retrieve pairs each
//! recalldb bench --tasks 16 --ops 500
//! ```

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use recalldb::storage::PoolStatus;
use recalldb::{ConcurrentMemoryManager, ManagerConfig, StoreOptions};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// RecallDB - Concurrent memory store
#[derive(Parser, Debug)]
#[command(name = "recalldb")]
#[command(version = recalldb::VERSION)]
#[command(about = "RecallDB - Concurrent access layer for assistant memory stores", long_about = None)]
#[command(author = "Anton Feldmann <afeldman@lynqtech.com>")]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Database file (overrides the configured path)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true, env = "RECALLDB_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "RECALLDB_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a value under a key
    Put(PutArgs),

    /// Print the value stored under a key
    Get {
        key: String,
    },

    /// Show metadata of the most recently accessed entry for a key
    Entry {
        key: String,
    },

    /// Show entry counts and pool occupancy
    Stats,

    /// Delete entries whose TTL has elapsed
    Purge,

    /// Print the effective configuration as TOML
    Config,

    /// Run concurrent store/retrieve load
    Bench(BenchArgs),
}

#[derive(Args, Debug)]
struct PutArgs {
    key: String,

    /// JSON value; anything that is not valid JSON is stored as a string
    value: String,

    /// Memory type
    #[arg(short = 't', long = "type", default_value = recalldb::entry::DEFAULT_MEMORY_TYPE)]
    memory_type: String,

    /// Priority
    #[arg(short, long, default_value = "1")]
    priority: i32,

    /// Time-to-live in seconds
    #[arg(long)]
    ttl: Option<u64>,

    /// Tag (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// zstd-compress the stored payload
    #[arg(long)]
    compress: bool,
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// Concurrent tasks
    #[arg(long, default_value = "8")]
    tasks: usize,

    /// Store/retrieve pairs per task
    #[arg(long, default_value = "200")]
    ops: usize,

    /// Distinct keys per task (reads cycle over them)
    #[arg(long, default_value = "50")]
    keys: usize,

    /// Print the collected metrics in Prometheus text format
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let mut config = ManagerConfig::load(cli.config.as_deref())?;
    if let Some(path) = &cli.database {
        config.database_path = path.clone();
    }

    match cli.command {
        Commands::Put(args) => put_command(config, args).await,
        Commands::Get { key } => get_command(config, key).await,
        Commands::Entry { key } => entry_command(config, key).await,
        Commands::Stats => stats_command(config).await,
        Commands::Purge => purge_command(config).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Bench(args) => bench_command(config, args).await,
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "recalldb.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    let (plain_file, json_file) = if cli.log_json {
        (None, Some(fmt::layer().json().with_writer(file_appender)))
    } else {
        (Some(fmt::layer().with_writer(file_appender).with_ansi(false)), None)
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .compact(),
        )
        .with(plain_file)
        .with(json_file)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

async fn put_command(config: ManagerConfig, args: PutArgs) -> anyhow::Result<()> {
    let manager = ConcurrentMemoryManager::open(config).await?;

    let value: Value = serde_json::from_str(&args.value).unwrap_or(Value::String(args.value));
    let mut options = StoreOptions::default()
        .memory_type(args.memory_type)
        .priority(args.priority)
        .compress(args.compress);
    if let Some(secs) = args.ttl {
        options = options.ttl(Duration::from_secs(secs));
    }
    for tag in args.tags {
        options = options.tag(tag);
    }

    let entry_id = manager.store_owned(&args.key, value, options).await?;
    manager.close().await?;

    println!("✅ Stored '{}' ({})", args.key, entry_id);
    Ok(())
}

async fn get_command(config: ManagerConfig, key: String) -> anyhow::Result<()> {
    let manager = ConcurrentMemoryManager::open(config).await?;
    let value = manager.retrieve(&key, None).await?;
    manager.close().await?;

    match value {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("❌ Key '{}' not found", key),
    }
    Ok(())
}

async fn entry_command(config: ManagerConfig, key: String) -> anyhow::Result<()> {
    let manager = ConcurrentMemoryManager::open(config).await?;
    let entry = manager.retrieve_entry(&key).await?;
    manager.close().await?;

    let Some(entry) = entry else {
        println!("❌ Key '{}' not found", key);
        return Ok(());
    };

    println!("Key:          {}", entry.key);
    println!("Entry ID:     {}", entry.entry_id);
    println!("Type:         {}", entry.memory_type);
    println!("Priority:     {}", entry.priority);
    println!("Created:      {}", entry.created_at.to_rfc3339());
    println!("Accessed:     {}", entry.accessed_at.to_rfc3339());
    println!("Access count: {}", entry.access_count);
    match entry.ttl {
        Some(ttl) => println!("TTL:          {:?}", ttl),
        None => println!("TTL:          none"),
    }
    if !entry.tags.is_empty() {
        let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
        println!("Tags:         {}", tags.join(", "));
    }
    println!(
        "Size:         {} bytes{}",
        entry.size_bytes,
        if entry.compressed { " (zstd)" } else { "" }
    );
    Ok(())
}

/// Summary of a store on disk
#[derive(Serialize)]
struct StoreSummary {
    database: PathBuf,
    entries: u64,
    expired_entries: u64,
    pool: PoolStatus,
    cache_capacity: usize,
    batch_size: usize,
}

async fn stats_command(config: ManagerConfig) -> anyhow::Result<()> {
    let manager = ConcurrentMemoryManager::open(config).await?;
    let counts = manager.entry_counts().await;
    let pool = manager.pool_status();
    manager.close().await?;
    let counts = counts?;

    let summary = StoreSummary {
        database: manager.config().database_path.clone(),
        entries: counts.total,
        expired_entries: counts.expired,
        pool,
        cache_capacity: manager.config().cache_max_size,
        batch_size: manager.config().batch_size,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn purge_command(config: ManagerConfig) -> anyhow::Result<()> {
    let manager = ConcurrentMemoryManager::open(config).await?;
    let removed = manager.purge_expired().await?;
    manager.close().await?;

    println!("✅ Purged {} expired entries", removed);
    Ok(())
}

async fn bench_command(config: ManagerConfig, args: BenchArgs) -> anyhow::Result<()> {
    let prometheus = if args.prometheus {
        Some(PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };

    let manager = Arc::new(ConcurrentMemoryManager::open(config).await?);
    let keys = args.keys.max(1);
    info!(tasks = args.tasks, ops = args.ops, keys, "Starting benchmark");

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.tasks);
    for task in 0..args.tasks {
        let manager = Arc::clone(&manager);
        let ops = args.ops;
        handles.push(tokio::spawn(async move {
            for i in 0..ops {
                let key = format!("bench:{}:{}", task, i % keys);
                let value = serde_json::json!({ "task": task, "op": i });
                manager.store_owned(&key, value, StoreOptions::default()).await?;
                manager.retrieve(&key, None).await?;
            }
            Ok::<_, recalldb::error::Error>(())
        }));
    }

    let mut failed = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "Benchmark task failed");
                failed += 1;
            }
        }
    }

    let report = manager.flush_all().await?;
    let elapsed = started.elapsed();
    let stats = manager.get_performance_stats();
    manager.close().await?;

    let total_ops = args.tasks * args.ops * 2;
    println!("Benchmark");
    println!("───────────────────────────────");
    println!("Tasks:        {} ({} failed)", args.tasks, failed);
    println!("Operations:   {}", total_ops);
    println!("Elapsed:      {:.2?}", elapsed);
    println!(
        "Throughput:   {:.0} ops/s",
        total_ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("Final flush:  {} operations", report.operations);
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let Some(handle) = prometheus {
        println!();
        print!("{}", handle.render());
    }
    Ok(())
}
