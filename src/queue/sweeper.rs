//! Background reclaim of expired leases.
//!
//! Every process may run a sweeper; the lock `workq.sweeper.<namespace>`
//! keeps at most one of them active per tick. Skipping a tick is harmless
//! since `lease()` already treats expired leases as absent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PriorityQueueStore;
use crate::error::{Error, Result};
use crate::lock::LockStore;

pub fn lock_name(namespace: &str) -> String {
    format!("workq.sweeper.{namespace}")
}

/// Run [`sweep_once`] every `interval` until `shutdown` is notified.
pub fn spawn(
    queue: PriorityQueueStore,
    locks: LockStore,
    interval: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(namespace = queue.namespace(), ?interval, "sweeper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!(namespace = queue.namespace(), "sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = sweep_once(&queue, &locks, interval).await {
                warn!(namespace = queue.namespace(), "sweep failed: {e}");
            }
        }
    })
}

/// One guarded sweep. Returns the reclaimed discriminators, or an empty
/// list when another process holds the sweeper lock.
pub async fn sweep_once(
    queue: &PriorityQueueStore,
    locks: &LockStore,
    hold_for: Duration,
) -> Result<Vec<String>> {
    let name = lock_name(queue.namespace());
    let token = match locks.acquire(&name, hold_for).await {
        Ok(token) => token,
        Err(Error::AlreadyLocked { .. }) => {
            debug!(lock = %name, "sweeper lock held elsewhere, skipping");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let swept = queue.sweep_expired().await;
    if let Err(e) = locks.release(&name, &token).await {
        warn!(lock = %name, "failed to release sweeper lock: {e}");
    }
    swept
}
