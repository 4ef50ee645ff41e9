//! Best-effort notification bus.
//!
//! Producers publish "item available" signals; idle workers subscribe so
//! they wake up before their next poll. Nothing is persisted and nothing
//! depends on delivery for correctness: the queue's lease and expiry
//! mechanism is the source of truth, the bus only shortens latency.
//!
//! Each process owns exactly one bus, built at startup and handed to every
//! component that needs it.

mod memory;
mod postgres;

pub use memory::LocalBus;
pub use postgres::PgBus;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::db::Db;
use crate::error::Result;

/// Handler invoked for every message published on a subscribed channel.
///
/// Runs on the publishing (or listener) task; keep it short and non-blocking.
pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// A message as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub message: serde_json::Value,
}

/// Handle identifying one registration, needed to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub(crate) channel: String,
    pub(crate) id: u64,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Channel on which a queue namespace announces newly available items.
pub fn item_available_channel(namespace: &str) -> String {
    format!("workq.{namespace}.item_available")
}

/// The process's notification bus, one variant per backend.
#[derive(Clone)]
pub enum NotificationBus {
    /// Delivers only to subscribers inside this process.
    InMemory(LocalBus),
    /// Fans out across processes through Postgres LISTEN/NOTIFY.
    Postgres(PgBus),
}

impl NotificationBus {
    pub fn in_memory() -> Self {
        NotificationBus::InMemory(LocalBus::new())
    }

    /// Connect a cross-process bus. Returns once the listener is registered.
    pub async fn postgres(db: &Db) -> Result<Self> {
        Ok(NotificationBus::Postgres(PgBus::connect(db).await?))
    }

    /// Register `callback` for every message published on `channel`.
    pub fn subscribe<F>(&self, channel: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.local().subscribe(channel.into(), Arc::new(callback))
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.local().unsubscribe(subscription)
    }

    /// Fire-and-forget publication to whoever is subscribed right now.
    pub async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<()> {
        match self {
            NotificationBus::InMemory(bus) => {
                bus.dispatch(&Notification {
                    channel: channel.to_string(),
                    message,
                });
                Ok(())
            }
            NotificationBus::Postgres(bus) => bus.publish(channel, message).await,
        }
    }

    /// Subscribe a [`Notify`] that is poked on every message on `channel`.
    ///
    /// Workers await `notified()` alongside their poll timer. `notify_one`
    /// stores a permit, so a message that lands between a failed lease and
    /// the wait is not lost.
    pub fn listen(&self, channel: impl Into<String>) -> (Subscription, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        let waker = Arc::clone(&notify);
        let subscription = self.subscribe(channel, move |_| waker.notify_one());
        (subscription, notify)
    }

    /// Number of live registrations on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.local().subscriber_count(channel)
    }

    /// Drop every subscription and stop any background listener.
    pub fn close(&self) {
        match self {
            NotificationBus::InMemory(bus) => bus.clear(),
            NotificationBus::Postgres(bus) => bus.close(),
        }
    }

    fn local(&self) -> &LocalBus {
        match self {
            NotificationBus::InMemory(bus) => bus,
            NotificationBus::Postgres(bus) => bus.local(),
        }
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationBus::InMemory(_) => f.write_str("NotificationBus::InMemory"),
            NotificationBus::Postgres(_) => f.write_str("NotificationBus::Postgres"),
        }
    }
}
