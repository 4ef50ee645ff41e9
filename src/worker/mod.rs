//! Worker runtime: lease items, run a handler, renew while it runs, dispose.

pub mod pool;

pub use pool::{Worker, WorkerConfig};

use std::future::Future;
use std::time::Duration;

use crate::model::Item;

/// What to do with a leased item once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished; remove the item.
    Acknowledge,
    /// Hand the lease back. The item stays at the head of its discriminator
    /// and becomes eligible after the delay (the configured requeue delay
    /// when `None`).
    Defer(Option<Duration>),
    /// Stop renewing and walk away. The lease runs out and the item is
    /// redelivered.
    Abandon,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acknowledge => "acknowledged",
            Disposition::Defer(_) => "deferred",
            Disposition::Abandon => "abandoned",
        }
    }
}

/// Processes one item at a time. Implemented for any
/// `Fn(Item) -> impl Future<Output = Disposition>`.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, item: Item) -> impl Future<Output = Disposition> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Disposition> + Send,
{
    fn handle(&self, item: Item) -> impl Future<Output = Disposition> + Send {
        self(item)
    }
}
