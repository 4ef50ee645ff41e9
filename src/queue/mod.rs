//! Lease-based priority queue keyed by discriminator.
//!
//! Items are grouped by discriminator into FIFO sub-queues. Only the head of
//! each sub-queue is eligible, and only while its discriminator carries no
//! live lease. `lease()` picks the eligible head with the lowest priority
//! value (oldest first on ties) and hands out a random token; the item stays
//! in the store until it is acknowledged under that token.
//!
//! Expiry is passive. A lease past its `expires_at` counts as absent on the
//! next `lease()`, so a crashed worker's item comes back without any
//! background task. [`sweeper`] only speeds that up.
//!
//! `defer` keeps the item at the head of its sub-queue with its original
//! priority; the whole discriminator just sits out `requeue_delay`.

mod memory;
mod postgres;
pub mod sweeper;

pub use memory::MemoryQueueStore;
pub use postgres::PgQueueStore;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::bus::{NotificationBus, item_available_channel};
use crate::config::{QueueOptions, TableNames, check_duration};
use crate::db::Db;
use crate::error::Result;
use crate::model::{Item, Lease, LeaseToken, LeasedItem, NewItem, QueueStats};
use crate::telemetry::metrics;

/// Where a renewal should move `expires_at` to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Expiry {
    At(DateTime<Utc>),
    /// Relative to the store's clock.
    After(Duration),
}

#[derive(Clone)]
enum Backend {
    InMemory(MemoryQueueStore),
    Postgres(PgQueueStore),
}

/// A priority queue for one namespace of items (commands, domain events, ...).
#[derive(Clone)]
pub struct PriorityQueueStore {
    backend: Backend,
    options: QueueOptions,
    bus: NotificationBus,
    channel: String,
}

impl PriorityQueueStore {
    pub fn in_memory(options: QueueOptions, bus: NotificationBus) -> Self {
        Self::with_backend(Backend::InMemory(MemoryQueueStore::new()), options, bus)
    }

    pub fn postgres(db: Db, tables: &TableNames, options: QueueOptions, bus: NotificationBus) -> Self {
        let backend = Backend::Postgres(PgQueueStore::new(db, &tables.items, &tables.queues));
        Self::with_backend(backend, options, bus)
    }

    fn with_backend(backend: Backend, options: QueueOptions, bus: NotificationBus) -> Self {
        let channel = item_available_channel(&options.namespace);
        Self {
            backend,
            options,
            bus,
            channel,
        }
    }

    pub async fn setup(&self) -> Result<()> {
        match &self.backend {
            Backend::InMemory(_) => Ok(()),
            Backend::Postgres(store) => store.setup().await,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.options.namespace
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Bus channel announcing new eligible items in this namespace.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Append to the discriminator's sub-queue. Fails `DuplicateItem` if the
    /// dedup key is already queued or in flight.
    pub async fn enqueue(&self, new: NewItem) -> Result<Item> {
        let result = match &self.backend {
            Backend::InMemory(store) => store.enqueue(new),
            Backend::Postgres(store) => store.enqueue(new).await,
        };
        self.record("enqueue", metrics::result_label(&result));
        let item = result?;

        debug!(
            namespace = %self.options.namespace,
            id = item.id.0,
            discriminator = %item.unit.discriminator,
            priority = item.priority,
            "item enqueued"
        );
        self.announce(&item.unit.discriminator, Some(&item)).await;
        Ok(item)
    }

    /// Lease the globally most urgent eligible head item. `None` means
    /// nothing is eligible right now.
    pub async fn lease(&self, worker_id: &str) -> Result<Option<LeasedItem>> {
        let ttl = self.options.expiration_time;
        let result = match &self.backend {
            Backend::InMemory(store) => store.lease(worker_id, ttl),
            Backend::Postgres(store) => store.lease(worker_id, ttl).await,
        };
        let label = match &result {
            Ok(Some(_)) => "ok",
            Ok(None) => "empty",
            Err(e) => e.kind().as_str(),
        };
        self.record("lease", label);

        if let Ok(Some(leased)) = &result {
            debug!(
                namespace = %self.options.namespace,
                id = leased.item.id.0,
                discriminator = %leased.item.unit.discriminator,
                worker_id,
                expires_at = %leased.lease.expires_at,
                "item leased"
            );
        }
        result
    }

    /// Move the lease's expiry to `new_expires_at`, which must lie beyond the
    /// current one.
    pub async fn renew(&self, token: &LeaseToken, new_expires_at: DateTime<Utc>) -> Result<Lease> {
        self.renew_to(token, Expiry::At(new_expires_at)).await
    }

    /// Renew for another full expiration time measured on the store's clock.
    pub async fn extend(&self, token: &LeaseToken) -> Result<Lease> {
        self.renew_to(token, Expiry::After(self.options.expiration_time))
            .await
    }

    async fn renew_to(&self, token: &LeaseToken, expiry: Expiry) -> Result<Lease> {
        let result = match &self.backend {
            Backend::InMemory(store) => store.renew(token, expiry),
            Backend::Postgres(store) => store.renew(token, expiry).await,
        };
        self.record("renew", metrics::result_label(&result));
        if let Err(e) = &result
            && e.is_ownership_lost()
        {
            warn!(namespace = %self.options.namespace, %token, "lease lost before renewal");
        }
        result
    }

    /// Remove the leased item for good.
    pub async fn acknowledge(&self, token: &LeaseToken) -> Result<Item> {
        let result = match &self.backend {
            Backend::InMemory(store) => store.acknowledge(token),
            Backend::Postgres(store) => store.acknowledge(token).await,
        };
        self.record("acknowledge", metrics::result_label(&result));
        let item = result?;

        debug!(
            namespace = %self.options.namespace,
            id = item.id.0,
            discriminator = %item.unit.discriminator,
            "item acknowledged"
        );
        // The next item of this discriminator just became eligible.
        self.announce(&item.unit.discriminator, None).await;
        Ok(item)
    }

    /// Give the lease back early. The item stays at the head of its
    /// sub-queue and becomes eligible after `requeue_delay` (the configured
    /// default when `None`).
    pub async fn defer(&self, token: &LeaseToken, requeue_delay: Option<Duration>) -> Result<()> {
        let delay = requeue_delay.unwrap_or(self.options.requeue_delay);
        check_duration("requeue delay", delay)?;
        let result = match &self.backend {
            Backend::InMemory(store) => store.defer(token, delay),
            Backend::Postgres(store) => store.defer(token, delay).await,
        };
        self.record("defer", metrics::result_label(&result));
        let discriminator = result?;

        debug!(namespace = %self.options.namespace, %discriminator, ?delay, "item deferred");
        if delay.is_zero() {
            self.announce(&discriminator, None).await;
        }
        Ok(())
    }

    /// Clear every expired lease and announce the affected discriminators.
    /// Returns the discriminators whose heads became eligible again.
    pub async fn sweep_expired(&self) -> Result<Vec<String>> {
        let result = match &self.backend {
            Backend::InMemory(store) => store.sweep_expired(),
            Backend::Postgres(store) => store.sweep_expired().await,
        };
        self.record("sweep", metrics::result_label(&result));
        let reclaimed = result?;

        for discriminator in &reclaimed {
            debug!(namespace = %self.options.namespace, %discriminator, "expired lease reclaimed");
            self.announce(discriminator, None).await;
        }
        Ok(reclaimed)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        match &self.backend {
            Backend::InMemory(store) => Ok(store.stats()),
            Backend::Postgres(store) => store.stats().await,
        }
    }

    /// Best effort: a lost notification only costs a poll interval.
    async fn announce(&self, discriminator: &str, item: Option<&Item>) {
        let message = json!({
            "namespace": self.options.namespace,
            "discriminator": discriminator,
            "id": item.map(|item| item.id.0),
        });
        if let Err(e) = self.bus.publish(&self.channel, message).await {
            warn!(namespace = %self.options.namespace, "failed to publish notification: {e}");
        }
    }

    fn record(&self, operation: &'static str, result: &'static str) {
        metrics::record_queue(&self.options.namespace, operation, result);
    }
}
