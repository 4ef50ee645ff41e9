//! Distributed, TTL-based mutual exclusion.
//!
//! A lock exists only while held. Acquisition is an atomic create-if-absent,
//! renewal and release are compare-and-swap on the token. Expiry is passive:
//! a record whose `expires_at` has passed is treated as absent by the next
//! `acquire`/`renew`, no sweeper required.

mod memory;
mod postgres;

pub use memory::MemoryLockStore;
pub use postgres::PgLockStore;

use std::time::Duration;

use tracing::debug;

use crate::config::check_duration;
use crate::db::Db;
use crate::error::Result;
use crate::model::{Lock, LockToken};
use crate::telemetry::metrics;

/// Lock store, one variant per backend.
#[derive(Clone)]
pub enum LockStore {
    InMemory(MemoryLockStore),
    Postgres(PgLockStore),
}

impl LockStore {
    pub fn in_memory() -> Self {
        LockStore::InMemory(MemoryLockStore::new())
    }

    pub fn postgres(db: Db, table: &str) -> Self {
        LockStore::Postgres(PgLockStore::new(db, table))
    }

    /// Create backing tables if needed.
    pub async fn setup(&self) -> Result<()> {
        match self {
            LockStore::InMemory(_) => Ok(()),
            LockStore::Postgres(store) => store.setup().await,
        }
    }

    /// Take the lock `name` for `ttl`. Fails `AlreadyLocked` while another
    /// holder's lock is unexpired.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<LockToken> {
        check_duration("lock ttl", ttl)?;
        let result = match self {
            LockStore::InMemory(store) => store.acquire(name, ttl),
            LockStore::Postgres(store) => store.acquire(name, ttl).await,
        };
        metrics::record_lock("acquire", metrics::result_label(&result));
        if let Ok(token) = &result {
            debug!(lock = name, %token, ?ttl, "lock acquired");
        }
        result
    }

    /// Push the lock's expiry to `now + ttl`. Fails `LockExpiredOrStolen` if
    /// `token` is no longer the live holder.
    pub async fn renew(&self, name: &str, token: &LockToken, ttl: Duration) -> Result<Lock> {
        check_duration("lock ttl", ttl)?;
        let result = match self {
            LockStore::InMemory(store) => store.renew(name, token, ttl),
            LockStore::Postgres(store) => store.renew(name, token, ttl).await,
        };
        metrics::record_lock("renew", metrics::result_label(&result));
        result
    }

    /// Give the lock up. Releasing an absent or already expired lock is a
    /// no-op; releasing someone else's live lock fails `LockExpiredOrStolen`.
    pub async fn release(&self, name: &str, token: &LockToken) -> Result<()> {
        let result = match self {
            LockStore::InMemory(store) => store.release(name, token),
            LockStore::Postgres(store) => store.release(name, token).await,
        };
        metrics::record_lock("release", metrics::result_label(&result));
        if result.is_ok() {
            debug!(lock = name, %token, "lock released");
        }
        result
    }
}
