//! Consumer progress tracking.
//!
//! Records, per (consumer, partition), the last durably processed position.
//! Updates are atomic compare-and-write: a position only ever moves forward,
//! so a slow worker can never clobber a faster one's progress. Stores built
//! with `allow_resets` accept any position (replay mode).

mod memory;
mod postgres;

pub use memory::MemoryProgressStore;
pub use postgres::PgProgressStore;

use tracing::{debug, warn};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::ProgressRecord;
use crate::telemetry::metrics;

/// Consumer progress store, one variant per backend.
#[derive(Clone)]
pub enum ConsumerProgressStore {
    InMemory(MemoryProgressStore),
    Postgres(PgProgressStore),
}

impl ConsumerProgressStore {
    pub fn in_memory(allow_resets: bool) -> Self {
        ConsumerProgressStore::InMemory(MemoryProgressStore::new(allow_resets))
    }

    pub fn postgres(db: Db, table: &str, allow_resets: bool) -> Self {
        ConsumerProgressStore::Postgres(PgProgressStore::new(db, table, allow_resets))
    }

    pub async fn setup(&self) -> Result<()> {
        match self {
            ConsumerProgressStore::InMemory(_) => Ok(()),
            ConsumerProgressStore::Postgres(store) => store.setup().await,
        }
    }

    /// Last recorded position, or `None` when the consumer has never
    /// recorded progress here (start from the beginning).
    pub async fn get_progress(&self, consumer: &str, partition: &str) -> Result<Option<i64>> {
        match self {
            ConsumerProgressStore::InMemory(store) => Ok(store.get(consumer, partition)),
            ConsumerProgressStore::Postgres(store) => store.get(consumer, partition).await,
        }
    }

    /// Record `position`. Fails `ProgressRegression` unless it is strictly
    /// greater than the stored one (or the store allows resets).
    pub async fn set_progress(
        &self,
        consumer: &str,
        partition: &str,
        position: i64,
    ) -> Result<ProgressRecord> {
        let result = match self {
            ConsumerProgressStore::InMemory(store) => store.set(consumer, partition, position),
            ConsumerProgressStore::Postgres(store) => {
                store.set(consumer, partition, position).await
            }
        };
        metrics::record_progress(consumer, metrics::result_label(&result));
        match &result {
            Ok(_) => debug!(consumer, partition, position, "progress recorded"),
            Err(Error::ProgressRegression { current, .. }) => {
                warn!(consumer, partition, position, current, "progress regression rejected")
            }
            Err(_) => {}
        }
        result.map(|position| ProgressRecord {
            consumer_name: consumer.to_string(),
            partition: partition.to_string(),
            position,
        })
    }

    /// Forget every partition's progress for `consumer`, e.g. before a replay.
    /// Returns the number of partitions cleared.
    pub async fn reset(&self, consumer: &str) -> Result<u64> {
        let cleared = match self {
            ConsumerProgressStore::InMemory(store) => store.reset(consumer),
            ConsumerProgressStore::Postgres(store) => store.reset(consumer).await?,
        };
        debug!(consumer, cleared, "progress reset");
        Ok(cleared)
    }
}

pub(crate) fn regression(consumer: &str, partition: &str, current: i64, attempted: i64) -> Error {
    Error::ProgressRegression {
        consumer: consumer.to_string(),
        partition: partition.to_string(),
        current,
        attempted,
    }
}
