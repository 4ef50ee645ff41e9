//! workq CLI: operator interface to the queue, lock and progress stores.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use workq::backend::Backend;
use workq::config::Config;
use workq::model::{Item, LockToken, NewItem};
use workq::telemetry::{TelemetryConfig, init_telemetry};
use workq::worker::{Disposition, Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "workq", about = "Keyed priority queue with leases, locks and progress")]
struct Cli {
    /// TOML configuration file; environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool that logs and acknowledges every item
    Serve {
        /// Consumer name to record progress under
        #[arg(long)]
        consumer: Option<String>,
    },
    /// Enqueue one item
    Enqueue {
        /// Items sharing a discriminator are processed one at a time, in order
        discriminator: String,
        /// Lower is more urgent
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        dedup_key: Option<String>,
    },
    /// Show queue counters
    Stats,
    /// Reclaim expired leases now
    Sweep,
    /// Consumer progress operations
    Progress {
        #[command(subcommand)]
        action: ProgressAction,
    },
    /// Lock operations
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum ProgressAction {
    Get { consumer: String, partition: String },
    Set {
        consumer: String,
        partition: String,
        position: i64,
    },
    /// Forget every partition of a consumer
    Reset { consumer: String },
}

#[derive(Subcommand)]
enum LockAction {
    /// Take a lock and print its token
    Acquire {
        name: String,
        #[arg(long, default_value_t = 30_000)]
        ttl_ms: u64,
    },
    Release { name: String, token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "workq"))?;
    let backend = Backend::connect(&config).await?;

    let result = match cli.command {
        Command::Serve { consumer } => cmd_serve(&config, &backend, consumer).await,
        Command::Enqueue {
            discriminator,
            priority,
            payload,
            dedup_key,
        } => cmd_enqueue(&backend, discriminator, priority, payload, dedup_key).await,
        Command::Stats => cmd_stats(&backend).await,
        Command::Sweep => {
            let reclaimed = backend.queue.sweep_expired().await?;
            println!("Reclaimed {} lease(s)", reclaimed.len());
            for discriminator in reclaimed {
                println!("  {discriminator}");
            }
            Ok(())
        }
        Command::Progress { action } => cmd_progress(&backend, action).await,
        Command::Lock { action } => cmd_lock(&backend, action).await,
    };

    backend.close().await;
    result
}

async fn cmd_serve(config: &Config, backend: &Backend, consumer: Option<String>) -> anyhow::Result<()> {
    let handler = |item: Item| async move {
        tracing::info!(
            id = item.id.0,
            discriminator = %item.unit.discriminator,
            payload = %item.unit.payload,
            "processing item"
        );
        Disposition::Acknowledge
    };

    let mut worker = Worker::new(backend.queue.clone(), handler, WorkerConfig::from_config(config))
        .with_sweeper(backend.locks.clone());
    if let Some(consumer) = &consumer {
        worker = worker.with_progress(backend.progress.clone(), consumer);
    }

    let stopper = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_enqueue(
    backend: &Backend,
    discriminator: String,
    priority: i32,
    payload: Option<String>,
    dedup_key: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewItem::new(&discriminator).payload(payload).priority(priority);
    if let Some(ref key) = dedup_key {
        new = new.dedup_key(key);
    }

    let item = backend.queue.enqueue(new).await?;
    println!(
        "Enqueued: {} (discriminator: {}, priority: {})",
        item.id, item.unit.discriminator, item.priority
    );
    Ok(())
}

async fn cmd_stats(backend: &Backend) -> anyhow::Result<()> {
    let stats = backend.queue.stats().await?;
    println!("{:<16}  {}", "NAMESPACE", backend.queue.namespace());
    println!("{:<16}  {}", "DISCRIMINATORS", stats.discriminators);
    println!("{:<16}  {}", "PENDING", stats.pending_items);
    println!("{:<16}  {}", "LEASED", stats.active_leases);
    Ok(())
}

async fn cmd_progress(backend: &Backend, action: ProgressAction) -> anyhow::Result<()> {
    match action {
        ProgressAction::Get {
            consumer,
            partition,
        } => match backend.progress.get_progress(&consumer, &partition).await? {
            Some(position) => println!("{position}"),
            None => println!("No progress recorded."),
        },
        ProgressAction::Set {
            consumer,
            partition,
            position,
        } => {
            let record = backend
                .progress
                .set_progress(&consumer, &partition, position)
                .await?;
            println!(
                "{}/{} -> {}",
                record.consumer_name, record.partition, record.position
            );
        }
        ProgressAction::Reset { consumer } => {
            let cleared = backend.progress.reset(&consumer).await?;
            println!("Cleared {cleared} partition(s)");
        }
    }
    Ok(())
}

async fn cmd_lock(backend: &Backend, action: LockAction) -> anyhow::Result<()> {
    match action {
        LockAction::Acquire { name, ttl_ms } => {
            let token = backend
                .locks
                .acquire(&name, Duration::from_millis(ttl_ms))
                .await?;
            println!("{token}");
        }
        LockAction::Release { name, token } => {
            let token: LockToken = token
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid lock token: {token}"))?;
            backend.locks.release(&name, &token).await?;
            println!("Released {name}");
        }
    }
    Ok(())
}
