//! Worker pool loop: wait for work, lease, run the handler under a renewing
//! lease, dispose of the item.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::{Disposition, Handler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lock::LockStore;
use crate::model::{Item, LeaseToken, LeasedItem};
use crate::progress::ConsumerProgressStore;
use crate::queue::{PriorityQueueStore, sweeper};
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_disposition, start_item_span};

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded on every lease this pool takes.
    pub worker_id: String,
    /// Maximum items in flight at once.
    pub concurrency: usize,
    /// Poll interval fallback when no notification arrives.
    pub poll_interval: Duration,
    /// Renew after this fraction of the queue's expiration time has passed.
    pub renewal_margin: f64,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: config.worker.concurrency,
            poll_interval: config.worker.poll_interval,
            renewal_margin: config.worker.renewal_margin,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Renewal period for leases granted with `expiration_time`.
    fn renewal_interval(&self, expiration_time: Duration) -> Duration {
        expiration_time
            .mul_f64(self.renewal_margin)
            .max(Duration::from_millis(1))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&Config::in_memory())
    }
}

/// Leases items from one queue and feeds them to a [`Handler`].
pub struct Worker<H> {
    queue: PriorityQueueStore,
    handler: Arc<H>,
    config: WorkerConfig,
    progress: Option<(ConsumerProgressStore, Arc<str>)>,
    sweeper_locks: Option<LockStore>,
    shutdown: Arc<Notify>,
    permits: Arc<Semaphore>,
}

impl<H> Clone for Worker<H> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            progress: self.progress.clone(),
            sweeper_locks: self.sweeper_locks.clone(),
            shutdown: Arc::clone(&self.shutdown),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<H: Handler> Worker<H> {
    pub fn new(queue: PriorityQueueStore, handler: H, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            queue,
            handler: Arc::new(handler),
            config,
            progress: None,
            sweeper_locks: None,
            shutdown: Arc::new(Notify::new()),
            permits,
        }
    }

    /// After each acknowledge, advance `consumer_name`'s progress for the
    /// item's discriminator to the item's sequence number.
    pub fn with_progress(mut self, store: ConsumerProgressStore, consumer_name: &str) -> Self {
        self.progress = Some((store, Arc::from(consumer_name)));
        self
    }

    /// Also run the expired-lease sweeper while this worker runs, if the
    /// queue has a sweep interval configured.
    pub fn with_sweeper(mut self, locks: LockStore) -> Self {
        self.sweeper_locks = Some(locks);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Signal the loop to stop taking new leases.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`shutdown`](Self::shutdown). Returns once every in-flight
    /// item has been disposed of.
    pub async fn run(&self) -> Result<()> {
        let bus = self.queue.bus().clone();
        let (subscription, wake) = bus.listen(self.queue.channel());
        let sweeper = self.spawn_sweeper();

        info!(
            worker_id = %self.config.worker_id,
            namespace = self.queue.namespace(),
            concurrency = self.config.concurrency,
            "worker started"
        );

        let mut in_flight = JoinSet::new();
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.notified() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("item task panicked: {e}");
                }
            }

            match self.queue.lease(&self.config.worker_id).await {
                Ok(Some(leased)) => {
                    let worker = self.clone();
                    in_flight.spawn(async move { worker.process(leased, permit).await });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    warn!("lease failed: {e}, falling back to poll");
                }
            }

            // Wait for: shutdown, notification, or poll timeout
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = wake.notified() => debug!("woken by notification"),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            in_flight = in_flight.len(),
            "worker shutting down"
        );
        bus.unsubscribe(&subscription);
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("item task panicked: {e}");
            }
        }
        if let Some((stop, handle)) = sweeper {
            stop.notify_one();
            let _ = handle.await;
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    fn spawn_sweeper(&self) -> Option<(Arc<Notify>, tokio::task::JoinHandle<()>)> {
        let locks = self.sweeper_locks.clone()?;
        let interval = self.queue.options().sweep_interval?;
        let stop = Arc::new(Notify::new());
        let handle = sweeper::spawn(self.queue.clone(), locks, interval, Arc::clone(&stop));
        Some((stop, handle))
    }

    async fn process(&self, leased: LeasedItem, _permit: OwnedSemaphorePermit) {
        let span = start_item_span(self.queue.namespace(), &leased.item);
        let started = Instant::now();

        let outcome = self.handle_leased(leased).instrument(span.clone()).await;

        record_disposition(&span, outcome);
        metrics::item_processing_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("namespace", self.queue.namespace().to_string()),
                KeyValue::new("disposition", outcome),
            ],
        );
    }

    /// Returns the disposition label actually applied.
    async fn handle_leased(&self, leased: LeasedItem) -> &'static str {
        let token = leased.lease.token;
        let item = leased.item;

        let Some(disposition) = self.run_with_renewal(&token, item.clone()).await else {
            return "lost";
        };

        let applied = match disposition {
            Disposition::Acknowledge => self.queue.acknowledge(&token).await.map(Some),
            Disposition::Defer(delay) => self.queue.defer(&token, delay).await.map(|()| None),
            Disposition::Abandon => {
                debug!(id = item.id.0, "item abandoned, leaving it to lease expiry");
                Ok(None)
            }
        };

        match applied {
            Ok(Some(acked)) => {
                self.advance_progress(&acked.unit.discriminator, acked.id.0).await;
                disposition.as_str()
            }
            Ok(None) => disposition.as_str(),
            Err(e) if e.is_ownership_lost() => {
                warn!(id = item.id.0, "lease lost before disposition, item will be redelivered");
                "lost"
            }
            Err(e) => {
                error!(id = item.id.0, "failed to apply disposition: {e}");
                "failed"
            }
        }
    }

    /// Drive the handler while renewing the lease every renewal interval.
    /// `None` means the lease was lost and the handler was cancelled.
    async fn run_with_renewal(&self, token: &LeaseToken, item: Item) -> Option<Disposition> {
        let every = self
            .config
            .renewal_interval(self.queue.options().expiration_time);
        let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        let handling = self.handler.handle(item);
        tokio::pin!(handling);

        loop {
            tokio::select! {
                disposition = &mut handling => return Some(disposition),
                _ = renewals.tick() => match self.queue.extend(token).await {
                    Ok(lease) => debug!(expires_at = %lease.expires_at, "lease renewed"),
                    Err(e) if e.is_ownership_lost() => {
                        warn!("lease lost during processing, cancelling handler");
                        return None;
                    }
                    Err(e) => warn!("lease renewal failed, retrying next tick: {e}"),
                },
            }
        }
    }

    async fn advance_progress(&self, discriminator: &str, sequence: u64) {
        let Some((store, consumer)) = &self.progress else {
            return;
        };
        let position = i64::try_from(sequence).unwrap_or(i64::MAX);
        match store.set_progress(consumer, discriminator, position).await {
            Ok(_) => {}
            // Redelivery of an item whose progress was already recorded.
            Err(Error::ProgressRegression { .. }) => {}
            Err(e) => error!(consumer = %consumer, discriminator, "failed to record progress: {e}"),
        }
    }
}
