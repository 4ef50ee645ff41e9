//! Build every store from one [`Config`].

use secrecy::ExposeSecret;
use tracing::info;

use crate::bus::NotificationBus;
use crate::config::{Config, StoreOptions};
use crate::db::Db;
use crate::error::Result;
use crate::lock::LockStore;
use crate::progress::ConsumerProgressStore;
use crate::queue::PriorityQueueStore;

/// The stores of one deployment, all on the same backend.
#[derive(Clone)]
pub struct Backend {
    /// `None` for the in-memory backend.
    pub db: Option<Db>,
    pub bus: NotificationBus,
    pub queue: PriorityQueueStore,
    pub locks: LockStore,
    pub progress: ConsumerProgressStore,
}

impl Backend {
    /// Validate `config`, connect, and create any missing tables.
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;

        let backend = match &config.store {
            StoreOptions::InMemory => {
                let bus = NotificationBus::in_memory();
                Self {
                    db: None,
                    queue: PriorityQueueStore::in_memory(config.queue.clone(), bus.clone()),
                    locks: LockStore::in_memory(),
                    progress: ConsumerProgressStore::in_memory(config.allow_progress_reset),
                    bus,
                }
            }
            StoreOptions::Postgres {
                database_url,
                max_connections,
            } => {
                let db = Db::connect(database_url.expose_secret(), *max_connections).await?;
                let bus = NotificationBus::postgres(&db).await?;
                Self {
                    queue: PriorityQueueStore::postgres(
                        db.clone(),
                        &config.tables,
                        config.queue.clone(),
                        bus.clone(),
                    ),
                    locks: LockStore::postgres(db.clone(), &config.tables.locks),
                    progress: ConsumerProgressStore::postgres(
                        db.clone(),
                        &config.tables.progress,
                        config.allow_progress_reset,
                    ),
                    bus,
                    db: Some(db),
                }
            }
        };

        backend.setup().await?;
        info!(
            store = config.store.kind(),
            namespace = %config.queue.namespace,
            "stores ready"
        );
        Ok(backend)
    }

    /// Create backing tables if needed. Idempotent.
    pub async fn setup(&self) -> Result<()> {
        self.locks.setup().await?;
        self.progress.setup().await?;
        self.queue.setup().await
    }

    /// Stop the bus listener and close the pool.
    pub async fn close(&self) {
        self.bus.close();
        if let Some(db) = &self.db {
            db.close().await;
        }
    }
}
