//! CLI command definitions for queue-director.
//!
//! - `run`: drive a director against Redis with the demo `action` work function
//! - `seed`: fill the store with demo items
//! - `stats`: report pending keys and stored payloads

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{Director, DirectorConfig, Worker, WorkerOptions};
use crate::store::{FetchOrder, QueueKeys, RedisStore, StoreError, WorkItem, DEFAULT_KEYS_KEY};

/// Default Redis connection URL.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Number of items written per pipeline by `seed`.
const SEED_BATCH_SIZE: usize = 1000;

/// Periodic store-backed work distributor.
#[derive(Parser)]
#[command(name = "queue-director")]
#[command(about = "Distribute work items from a Redis queue across a scaling worker pool")]
#[command(version)]
#[command(
    long_about = "queue-director fetches pending items from a Redis set or sorted set, splits them across a pool of concurrent workers that grows on demand, and removes delivered items.\n\nExample usage:\n  queue-director seed --count 10000 --keys-key test_writer\n  queue-director run --keys-key test_writer --workers-limit 200 --per-worker-limit 1000"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a director with the demo `action` work function until Ctrl-C.
    Run(RunArgs),

    /// Populate the store with demo items (first half succeed, second half fail).
    Seed(SeedArgs),

    /// Print pending key and payload counts.
    Stats(StatsArgs),
}

/// Store connection arguments shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Key of the set (or sorted set) holding pending item keys.
    #[arg(short = 'k', long, default_value = DEFAULT_KEYS_KEY)]
    pub keys_key: String,

    /// Key of the payload hash (default: `<keys-key>_values`).
    #[arg(long)]
    pub values_key: Option<String>,

    /// Use the sorted set and priority fetch instead of the plain set.
    #[arg(long)]
    pub prioritized: bool,
}

impl StoreArgs {
    /// Builds the queue key names.
    pub fn queue_keys(&self) -> Result<QueueKeys, StoreError> {
        match &self.values_key {
            Some(values_key) => QueueKeys::with_values_key(&self.keys_key, values_key),
            None => QueueKeys::new(&self.keys_key),
        }
    }

    /// The fetch order selected by `--prioritized`.
    pub fn fetch_order(&self) -> FetchOrder {
        FetchOrder::from_prioritized(self.prioritized)
    }

    async fn connect(&self) -> anyhow::Result<RedisStore> {
        let store = RedisStore::connect(&self.redis_url, self.queue_keys()?)
            .await
            .with_context(|| format!("Failed to connect to {}", self.redis_url))?;
        Ok(store)
    }
}

/// Arguments for `queue-director run`.
///
/// Unset limits fall back to the `DIRECTOR_*` environment variables.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Maximum number of items fetched per tick.
    #[arg(long)]
    pub queue_limit: Option<usize>,

    /// Maximum number of items handed to one worker per tick.
    #[arg(long)]
    pub per_worker_limit: Option<usize>,

    /// Number of base workers.
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Enable dynamic scaling up to this many workers.
    #[arg(short = 'w', long)]
    pub workers_limit: Option<usize>,

    /// Tick interval in milliseconds.
    #[arg(short = 'i', long)]
    pub interval_ms: Option<u64>,

    /// Log worker creation, queue length and deletions.
    #[arg(long)]
    pub detail_log: bool,

    /// Also remove items whose work function failed.
    #[arg(long)]
    pub remove_failed: bool,

    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

impl RunArgs {
    /// Applies command-line overrides on top of `config`.
    pub fn apply(&self, config: DirectorConfig) -> DirectorConfig {
        let mut config = config;

        if let Some(limit) = self.queue_limit {
            config = config.with_queue_limit(limit);
        }
        if let Some(limit) = self.per_worker_limit {
            config = config.with_per_worker_limit(limit);
        }
        if let Some(threads) = self.threads {
            config = config.with_threads(threads);
        }
        if let Some(limit) = self.workers_limit {
            config = config.with_dynamic_threads(limit);
        }
        if let Some(millis) = self.interval_ms {
            config = config.with_work_loop_interval(Duration::from_millis(millis));
        }
        if self.store.prioritized {
            config = config.with_prioritized_queue(true);
        }
        if self.detail_log {
            config = config.with_detail_log(true);
        }

        config
    }
}

/// Arguments for `queue-director seed`.
#[derive(Parser, Debug)]
pub struct SeedArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Number of items to create.
    #[arg(short = 'n', long, default_value = "1000")]
    pub count: usize,
}

/// Arguments for `queue-director stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Payload of a demo item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    /// Whether processing succeeds.
    pub action: bool,
    /// Sequence number assigned by `seed`.
    #[serde(default)]
    pub check: u64,
    pub key: String,
}

/// Demo work function: succeeds and removes the item when `action` is true.
pub async fn run_action(worker: Arc<Worker>, item: WorkItem) -> anyhow::Result<Value> {
    let payload: ActionPayload = item
        .decode()
        .with_context(|| format!("Invalid payload for {}", item.key))?;

    if !payload.action {
        anyhow::bail!("action is false");
    }

    worker.director().remove_from_store(item.key.clone());
    Ok(json!({
        "message": format!("Work resolved for key {}", payload.key),
        "key": payload.key,
    }))
}

/// Builds `count` demo items; the first half succeed.
pub fn seed_items(count: usize) -> Result<Vec<WorkItem>, serde_json::Error> {
    (0..count)
        .map(|i| {
            let key = format!("test_{}", i);
            let payload = ActionPayload {
                action: 2 * i < count,
                check: i as u64,
                key: key.clone(),
            };
            WorkItem::from_json(key, &payload)
        })
        .collect()
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_director_command(args).await,
        Commands::Seed(args) => run_seed_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_director_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.apply(DirectorConfig::from_env()?);
    if args.print_metrics {
        init_metrics()?;
    }

    let store = Arc::new(args.store.connect().await?);
    let remove_failed = args.remove_failed;

    let worker_options = WorkerOptions::new()
        .work_function(run_action)
        .on_work_error(move |worker, item, error| {
            debug!(worker_id = worker.id(), key = %item.key, error = %error, "Item failed");
            if remove_failed {
                worker.director().remove_from_store(item.key.clone());
            }
        });

    let director = Director::builder()
        .config(config)
        .store(store)
        .worker_options(worker_options)
        .on_work_success(|director, worker, report| {
            info!(
                worker_id = worker.id(),
                succeeded = report.succeeded(),
                failed = report.failed(),
                queue_len = director.queue_len(),
                "Worker finished batch"
            );
        })
        .on_work_error(|_director, worker, error| {
            warn!(worker_id = worker.id(), error = %error, "Worker failed");
        })
        .build()?;

    director.run()?;
    info!(
        keys_key = %args.store.keys_key,
        "Director running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    director.stop_work();
    info!(
        workers = director.worker_count(),
        queue_len = director.queue_len(),
        "Work loop stopped"
    );

    if args.print_metrics {
        println!("{}", export_metrics());
    }

    Ok(())
}

async fn run_seed_command(args: SeedArgs) -> anyhow::Result<()> {
    let store = args.store.connect().await?;
    let order = args.store.fetch_order();
    let items = seed_items(args.count)?;

    for (batch, chunk) in items.chunks(SEED_BATCH_SIZE).enumerate() {
        let offset = batch * SEED_BATCH_SIZE;
        store
            .push_batch(order, chunk, |index| (offset + index) as f64)
            .await?;
    }

    info!(
        count = args.count,
        keys_key = %store.keys().keys_key(),
        "Seeded store"
    );
    Ok(())
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let store = args.store.connect().await?;
    let stats = store.stats(args.store.fetch_order()).await?;

    if args.json {
        let summary = json!({
            "keys_key": store.keys().keys_key(),
            "values_key": store.keys().values_key(),
            "pending_keys": stats.pending_keys,
            "payloads": stats.payloads,
            "orphaned": stats.orphaned(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Keys key:     {}", store.keys().keys_key());
        println!("Values key:   {}", store.keys().values_key());
        println!("Pending keys: {}", stats.pending_keys);
        println!("Payloads:     {}", stats.payloads);
        if stats.orphaned() > 0 {
            println!("Orphaned:     {}", stats.orphaned());
        }
    }

    Ok(())
}
