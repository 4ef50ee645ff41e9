//! Core data model.
//!
//! An item is a unit of work keyed by a discriminator. Items sharing a
//! discriminator are delivered one at a time, in enqueue order, under a
//! token-authenticated lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// The payload half of an item: what to do and which processor it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Key whose items must be processed strictly one at a time
    /// (an aggregate instance, a flow partition, ...).
    pub discriminator: String,

    /// Opaque to the queue.
    pub payload: serde_json::Value,
}

/// A queued work unit plus the delivery metadata the store assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Store-assigned sequence number. Unrelated to any id inside the payload.
    pub id: ItemId,

    pub unit: WorkUnit,

    /// Lower = more urgent. Ties are broken by `enqueued_at`.
    pub priority: i32,

    /// Idempotency key, unique among undelivered and in-flight items.
    pub dedup_key: Option<String>,

    pub enqueued_at: DateTime<Utc>,
}

impl Item {
    pub fn discriminator(&self) -> &str {
        &self.unit.discriminator
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.unit.payload
    }
}

/// Newtype for store-assigned item sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// `now + ttl`, saturating instead of overflowing for absurd TTLs.
pub(crate) fn deadline(now: DateTime<Utc>, ttl: std::time::Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Opaque proof of ownership of a discriminator's head item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LeaseToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Time-bounded exclusive claim on the head item of one discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// What `lease()` hands to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedItem {
    pub item: Item,
    pub lease: Lease,
}

impl LeasedItem {
    pub fn token(&self) -> &LeaseToken {
        &self.lease.token
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LockToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// A held lock. Only exists while unexpired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub name: String,
    pub token: LockToken,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// How far one consumer has durably progressed within one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub consumer_name: String,
    pub partition: String,
    pub position: i64,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time counts for one queue namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub discriminators: u64,
    pub pending_items: u64,
    pub active_leases: u64,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for items to enqueue. The queue's public API for producers.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub(crate) discriminator: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: i32,
    pub(crate) dedup_key: Option<String>,
}

impl NewItem {
    pub fn new(discriminator: impl Into<String>) -> Self {
        Self {
            discriminator: discriminator.into(),
            payload: serde_json::Value::Null,
            priority: 0,
            dedup_key: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Dedup on the item's own identity as seen by the submitting client.
    pub fn identity(self, item_id: impl std::fmt::Display, client_id: impl std::fmt::Display) -> Self {
        self.dedup_key(format!("{client_id}/{item_id}"))
    }

    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    pub(crate) fn into_item(self, id: ItemId, enqueued_at: DateTime<Utc>) -> Item {
        Item {
            id,
            unit: WorkUnit {
                discriminator: self.discriminator,
                payload: self.payload,
            },
            priority: self.priority,
            dedup_key: self.dedup_key,
            enqueued_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_derives_dedup_key_from_client_and_item() {
        let new = NewItem::new("agg-1").identity("cmd-42", "client-7");
        assert_eq!(new.dedup_key.as_deref(), Some("client-7/cmd-42"));
    }

    #[test]
    fn lease_liveness_is_strictly_before_expiry() {
        let now = Utc::now();
        let lease = Lease {
            token: LeaseToken::new(),
            worker_id: "w".to_string(),
            expires_at: now,
        };
        assert!(!lease.is_live_at(now));
        assert!(lease.is_live_at(now - chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn tokens_round_trip_through_display() {
        let token = LeaseToken::new();
        let parsed: LeaseToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
    }
}
