//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on anything malformed: no store is
//! constructed from a configuration that did not pass [`Config::validate`].
//! The database URL is wrapped in `secrecy::SecretString` to keep it out of logs.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_EXPIRATION_MS: u64 = 30_000;
const DEFAULT_RENEWAL_MARGIN: f64 = 0.5;
const DEFAULT_CONCURRENCY: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Upper bound for every lease TTL, lock TTL and delay.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug)]
pub struct Config {
    pub store: StoreOptions,
    pub tables: TableNames,
    pub queue: QueueOptions,
    pub worker: WorkerOptions,
    /// Let `set_progress` overwrite with any position (replay mode).
    pub allow_progress_reset: bool,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Which backend every store is built on.
#[derive(Debug)]
pub enum StoreOptions {
    InMemory,
    Postgres {
        database_url: SecretString,
        max_connections: u32,
    },
}

impl StoreOptions {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreOptions::InMemory => "in_memory",
            StoreOptions::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableNames {
    pub locks: String,
    pub progress: String,
    pub items: String,
    pub queues: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            locks: "locks".to_string(),
            progress: "progress".to_string(),
            items: "items".to_string(),
            queues: "priority_queue".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Notification channel namespace; one per kind of item (commands, events, ...).
    pub namespace: String,
    /// Lease TTL.
    pub expiration_time: Duration,
    /// Default delay before a deferred item becomes eligible again.
    pub requeue_delay: Duration,
    /// `None` disables the optional expired-lease sweeper.
    pub sweep_interval: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            expiration_time: Duration::from_millis(DEFAULT_EXPIRATION_MS),
            requeue_delay: Duration::ZERO,
            sweep_interval: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Maximum leases held at once by one worker pool.
    pub concurrency: usize,
    /// Fraction of the lease TTL after which a renewal is sent.
    pub renewal_margin: f64,
    /// Fallback poll when no notification arrives.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl Config {
    /// In-memory configuration with defaults everywhere. Useful for tests and
    /// single-process deployments.
    pub fn in_memory() -> Self {
        Self {
            store: StoreOptions::InMemory,
            tables: TableNames::default(),
            queue: QueueOptions::default(),
            worker: WorkerOptions::default(),
            allow_progress_reset: false,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let store = match optional_var("STORE_TYPE").as_deref().unwrap_or("in_memory") {
            "in_memory" => StoreOptions::InMemory,
            "postgres" => StoreOptions::Postgres {
                database_url: SecretString::from(required_var("DATABASE_URL")?),
                max_connections: parsed_var("DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
            other => {
                return Err(Error::MalformedConfiguration(format!(
                    "unknown STORE_TYPE '{other}' (expected in_memory or postgres)"
                )));
            }
        };

        let defaults = TableNames::default();
        let tables = TableNames {
            locks: optional_var("TABLE_LOCKS").unwrap_or(defaults.locks),
            progress: optional_var("TABLE_PROGRESS").unwrap_or(defaults.progress),
            items: optional_var("TABLE_ITEMS").unwrap_or(defaults.items),
            queues: optional_var("TABLE_QUEUES").unwrap_or(defaults.queues),
        };

        let queue = QueueOptions {
            namespace: optional_var("QUEUE_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            expiration_time: Duration::from_millis(
                parsed_var("LEASE_EXPIRATION_MS")?.unwrap_or(DEFAULT_EXPIRATION_MS),
            ),
            requeue_delay: Duration::from_millis(parsed_var("REQUEUE_DELAY_MS")?.unwrap_or(0)),
            sweep_interval: parsed_var::<u64>("SWEEP_INTERVAL_MS")?.map(Duration::from_millis),
        };

        let worker = WorkerOptions {
            concurrency: parsed_var("WORKER_CONCURRENCY")?.unwrap_or(DEFAULT_CONCURRENCY),
            renewal_margin: parsed_var("RENEWAL_MARGIN")?.unwrap_or(DEFAULT_RENEWAL_MARGIN),
            poll_interval: Duration::from_millis(
                parsed_var("POLL_INTERVAL_MS")?.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
        };

        let config = Self {
            store,
            tables,
            queue,
            worker,
            allow_progress_reset: parsed_var("ALLOW_PROGRESS_RESET")?.unwrap_or(false),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(source)
            .map_err(|e| Error::MalformedConfiguration(format!("invalid TOML: {e}")))?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::MalformedConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject anything the stores cannot safely run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.expiration_time.is_zero() {
            return Err(malformed("lease expiration time must be positive"));
        }
        check_duration("lease expiration time", self.queue.expiration_time)?;
        check_duration("requeue delay", self.queue.requeue_delay)?;
        if let Some(interval) = self.queue.sweep_interval {
            check_duration("sweep interval", interval)?;
        }
        if !(self.worker.renewal_margin > 0.0 && self.worker.renewal_margin < 1.0) {
            return Err(malformed(format!(
                "renewal margin must lie strictly between 0 and 1, got {}",
                self.worker.renewal_margin
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(malformed("worker concurrency must be at least 1"));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(malformed("poll interval must be positive"));
        }
        if self.queue.namespace.trim().is_empty() {
            return Err(malformed("queue namespace must not be empty"));
        }
        if let Some(interval) = self.queue.sweep_interval
            && interval.is_zero()
        {
            return Err(malformed("sweep interval must be positive when set"));
        }

        let tables = [
            ("locks", &self.tables.locks),
            ("progress", &self.tables.progress),
            ("items", &self.tables.items),
            ("queues", &self.tables.queues),
        ];
        for (role, name) in tables {
            if name.trim().is_empty() {
                return Err(malformed(format!("table name for {role} must not be empty")));
            }
        }
        for (i, (role_a, a)) in tables.iter().enumerate() {
            for (role_b, b) in &tables[i + 1..] {
                if a == b {
                    return Err(malformed(format!(
                        "tables for {role_a} and {role_b} share the name '{a}'"
                    )));
                }
            }
        }

        if let StoreOptions::Postgres {
            max_connections, ..
        } = &self.store
            && *max_connections == 0
        {
            return Err(malformed("database max_connections must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TOML representation
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    store: RawStore,
    #[serde(default)]
    tables: TableNames,
    #[serde(default)]
    queue: RawQueue,
    #[serde(default)]
    worker: RawWorker,
    #[serde(default)]
    allow_progress_reset: bool,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
enum RawStore {
    InMemory,
    Postgres {
        database_url: String,
        max_connections: Option<u32>,
    },
}

#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawQueue {
    namespace: String,
    expiration_time_ms: u64,
    requeue_delay_ms: u64,
    sweep_interval_ms: Option<u64>,
}

impl Default for RawQueue {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            expiration_time_ms: DEFAULT_EXPIRATION_MS,
            requeue_delay_ms: 0,
            sweep_interval_ms: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawWorker {
    concurrency: usize,
    renewal_margin: f64,
    poll_interval_ms: u64,
}

impl Default for RawWorker {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl RawConfig {
    fn into_config(self) -> Config {
        let store = match self.store {
            RawStore::InMemory => StoreOptions::InMemory,
            RawStore::Postgres {
                database_url,
                max_connections,
            } => StoreOptions::Postgres {
                database_url: SecretString::from(database_url),
                max_connections: max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
        };
        Config {
            store,
            tables: self.tables,
            queue: QueueOptions {
                namespace: self.queue.namespace,
                expiration_time: Duration::from_millis(self.queue.expiration_time_ms),
                requeue_delay: Duration::from_millis(self.queue.requeue_delay_ms),
                sweep_interval: self.queue.sweep_interval_ms.map(Duration::from_millis),
            },
            worker: WorkerOptions {
                concurrency: self.worker.concurrency,
                renewal_margin: self.worker.renewal_margin,
                poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            },
            allow_progress_reset: self.allow_progress_reset,
            otel_endpoint: self.otel_endpoint,
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn malformed(message: impl Into<String>) -> Error {
    Error::MalformedConfiguration(message.into())
}

/// Reject durations beyond [`MAX_DURATION`].
pub(crate) fn check_duration(what: &str, duration: Duration) -> Result<()> {
    if duration > MAX_DURATION {
        return Err(malformed(format!(
            "{what} of {duration:?} exceeds the maximum of {MAX_DURATION:?}"
        )));
    }
    Ok(())
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| malformed(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| malformed(format!("{name}={raw:?} is invalid: {e}")))
        })
        .transpose()
}
