//! Postgres queue backend.
//!
//! Two tables: `items` holds every undelivered item in sequence order, and
//! `queues` holds one row per discriminator carrying the lease. Lease
//! acquisition is a single `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP
//! LOCKED)` so two workers can never pick the same head. Enqueue and
//! acknowledge both write-lock the discriminator's row, which serializes
//! "last item acknowledged" against "new item enqueued".

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::Expiry;
use crate::db::{Db, millis, quote_ident};
use crate::error::{Error, Result};
use crate::model::{Item, ItemId, Lease, LeaseToken, LeasedItem, NewItem, QueueStats, WorkUnit};

#[derive(Clone)]
pub struct PgQueueStore {
    db: Db,
    items: String,
    queues: String,
    items_index: String,
}

impl PgQueueStore {
    pub fn new(db: Db, items_table: &str, queues_table: &str) -> Self {
        Self {
            db,
            items: quote_ident(items_table),
            queues: quote_ident(queues_table),
            items_index: quote_ident(&format!("{items_table}_discriminator_idx")),
        }
    }

    pub(crate) async fn setup(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {items} (
                id             BIGSERIAL PRIMARY KEY,
                discriminator  TEXT NOT NULL,
                priority       INTEGER NOT NULL,
                dedup_key      TEXT UNIQUE,
                payload        JSONB NOT NULL,
                enqueued_at    TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
            )",
            items = self.items
        ))
        .execute(self.db.pool())
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {idx} ON {items} (discriminator, id)",
            idx = self.items_index,
            items = self.items
        ))
        .execute(self.db.pool())
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {queues} (
                discriminator     TEXT PRIMARY KEY,
                lease_token       UUID UNIQUE,
                worker_id         TEXT,
                lease_expires_at  TIMESTAMPTZ,
                available_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            queues = self.queues
        ))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub(crate) async fn enqueue(&self, new: NewItem) -> Result<Item> {
        let mut tx = self.db.pool().begin().await?;

        // Row-lock the discriminator first; an acknowledge draining the
        // sub-queue concurrently either sees this item or recreates nothing.
        sqlx::query(&format!(
            "INSERT INTO {queues} AS q (discriminator) VALUES ($1)
             ON CONFLICT (discriminator) DO UPDATE SET discriminator = q.discriminator",
            queues = self.queues
        ))
        .bind(&new.discriminator)
        .execute(&mut *tx)
        .await?;

        let inserted: Option<(i64, DateTime<Utc>)> = sqlx::query_as(&format!(
            "INSERT INTO {items} (discriminator, priority, dedup_key, payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (dedup_key) DO NOTHING
             RETURNING id, enqueued_at",
            items = self.items
        ))
        .bind(&new.discriminator)
        .bind(new.priority)
        .bind(&new.dedup_key)
        .bind(&new.payload)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, enqueued_at)) = inserted else {
            // Dropping the transaction rolls back the queue row upsert.
            return Err(Error::DuplicateItem {
                dedup_key: new.dedup_key.unwrap_or_default(),
            });
        };
        tx.commit().await?;

        Ok(new.into_item(ItemId(id as u64), enqueued_at))
    }

    pub(crate) async fn lease(&self, worker_id: &str, ttl: Duration) -> Result<Option<LeasedItem>> {
        let token = LeaseToken::new();
        let mut tx = self.db.pool().begin().await?;

        let picked: Option<(i64, DateTime<Utc>)> = sqlx::query_as(&format!(
            "UPDATE {queues} AS q
             SET lease_token = $1,
                 worker_id = $2,
                 lease_expires_at = now() + $3::float8 * interval '1 millisecond'
             FROM (
                SELECT c.discriminator, h.id
                FROM {queues} AS c
                CROSS JOIN LATERAL (
                    SELECT i.id, i.priority, i.enqueued_at
                    FROM {items} AS i
                    WHERE i.discriminator = c.discriminator
                    ORDER BY i.id
                    LIMIT 1
                ) AS h
                WHERE (c.lease_token IS NULL OR c.lease_expires_at <= now())
                  AND c.available_at <= now()
                ORDER BY h.priority, h.enqueued_at, h.id
                LIMIT 1
                FOR UPDATE OF c SKIP LOCKED
             ) AS picked
             WHERE q.discriminator = picked.discriminator
             RETURNING picked.id, q.lease_expires_at",
            queues = self.queues,
            items = self.items
        ))
        .bind(token.0)
        .bind(worker_id)
        .bind(millis(ttl))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, expires_at)) = picked else {
            return Ok(None);
        };

        let row: ItemRow = sqlx::query_as(&format!(
            "SELECT id, discriminator, priority, dedup_key, payload, enqueued_at
             FROM {items} WHERE id = $1",
            items = self.items
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(LeasedItem {
            item: row.into_item(),
            lease: Lease {
                token,
                worker_id: worker_id.to_string(),
                expires_at,
            },
        }))
    }

    pub(crate) async fn renew(&self, token: &LeaseToken, expiry: Expiry) -> Result<Lease> {
        let (at, after_ms) = match expiry {
            Expiry::At(at) => (Some(at), 0),
            Expiry::After(ttl) => (None, millis(ttl)),
        };

        let renewed: Option<(String, DateTime<Utc>)> = sqlx::query_as(&format!(
            "UPDATE {queues} AS q
             SET lease_expires_at = t.expires_at
             FROM (
                SELECT COALESCE($2::timestamptz, now() + $3::float8 * interval '1 millisecond')
                    AS expires_at
             ) AS t
             WHERE q.lease_token = $1
               AND q.lease_expires_at > now()
               AND t.expires_at > q.lease_expires_at
             RETURNING q.worker_id, q.lease_expires_at",
            queues = self.queues
        ))
        .bind(token.0)
        .bind(at)
        .bind(after_ms)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some((worker_id, expires_at)) = renewed {
            return Ok(Lease {
                token: *token,
                worker_id,
                expires_at,
            });
        }

        // Tell "not yours any more" apart from "not far enough".
        match self.live_expiry(token).await? {
            Some(current) => Err(Error::LeaseNotExtended { current }),
            None => Err(Error::LeaseExpiredOrStolen),
        }
    }

    pub(crate) async fn acknowledge(&self, token: &LeaseToken) -> Result<Item> {
        let mut tx = self.db.pool().begin().await?;

        let owned: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT discriminator FROM {queues}
             WHERE lease_token = $1 AND lease_expires_at > now()
             FOR UPDATE",
            queues = self.queues
        ))
        .bind(token.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((discriminator,)) = owned else {
            return Err(Error::LeaseExpiredOrStolen);
        };

        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "DELETE FROM {items}
             WHERE id = (
                SELECT id FROM {items} WHERE discriminator = $1 ORDER BY id LIMIT 1
             )
             RETURNING id, discriminator, priority, dedup_key, payload, enqueued_at",
            items = self.items
        ))
        .bind(&discriminator)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(Error::LeaseExpiredOrStolen);
        };

        sqlx::query(&format!(
            "UPDATE {queues}
             SET lease_token = NULL, worker_id = NULL, lease_expires_at = NULL, available_at = now()
             WHERE discriminator = $1",
            queues = self.queues
        ))
        .bind(&discriminator)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM {queues}
             WHERE discriminator = $1
               AND NOT EXISTS (SELECT 1 FROM {items} WHERE discriminator = $1)",
            queues = self.queues,
            items = self.items
        ))
        .bind(&discriminator)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into_item())
    }

    pub(crate) async fn defer(&self, token: &LeaseToken, delay: Duration) -> Result<String> {
        let released: Option<(String,)> = sqlx::query_as(&format!(
            "UPDATE {queues}
             SET lease_token = NULL,
                 worker_id = NULL,
                 lease_expires_at = NULL,
                 available_at = now() + $2::float8 * interval '1 millisecond'
             WHERE lease_token = $1 AND lease_expires_at > now()
             RETURNING discriminator",
            queues = self.queues
        ))
        .bind(token.0)
        .bind(millis(delay))
        .fetch_optional(self.db.pool())
        .await?;

        released
            .map(|(discriminator,)| discriminator)
            .ok_or(Error::LeaseExpiredOrStolen)
    }

    pub(crate) async fn sweep_expired(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "UPDATE {queues}
             SET lease_token = NULL, worker_id = NULL, lease_expires_at = NULL
             WHERE lease_token IS NOT NULL AND lease_expires_at <= now()
             RETURNING discriminator",
            queues = self.queues
        ))
        .fetch_all(self.db.pool())
        .await?;

        let mut reclaimed: Vec<String> = rows.into_iter().map(|(d,)| d).collect();
        reclaimed.sort();
        Ok(reclaimed)
    }

    pub(crate) async fn stats(&self) -> Result<QueueStats> {
        let (discriminators, pending_items, active_leases): (i64, i64, i64) =
            sqlx::query_as(&format!(
                "SELECT
                    (SELECT count(*) FROM {queues}),
                    (SELECT count(*) FROM {items}),
                    (SELECT count(*) FROM {queues}
                        WHERE lease_token IS NOT NULL AND lease_expires_at > now())",
                queues = self.queues,
                items = self.items
            ))
            .fetch_one(self.db.pool())
            .await?;

        Ok(QueueStats {
            discriminators: discriminators as u64,
            pending_items: pending_items as u64,
            active_leases: active_leases as u64,
        })
    }

    async fn live_expiry(&self, token: &LeaseToken) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(&format!(
            "SELECT lease_expires_at FROM {queues}
             WHERE lease_token = $1 AND lease_expires_at > now()",
            queues = self.queues
        ))
        .bind(token.0)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|(expires_at,)| expires_at))
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ItemRow {
    id: i64,
    discriminator: String,
    priority: i32,
    dedup_key: Option<String>,
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
}

impl ItemRow {
    fn into_item(self) -> Item {
        Item {
            id: ItemId(self.id as u64),
            unit: WorkUnit {
                discriminator: self.discriminator,
                payload: self.payload,
            },
            priority: self.priority,
            dedup_key: self.dedup_key,
            enqueued_at: self.enqueued_at,
        }
    }
}
