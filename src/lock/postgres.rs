use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{Db, millis, quote_ident};
use crate::error::{Error, Result};
use crate::model::{Lock, LockToken};

/// Locks stored as rows keyed by name; the database clock decides expiry.
#[derive(Clone)]
pub struct PgLockStore {
    db: Db,
    table: String,
}

impl PgLockStore {
    pub fn new(db: Db, table: &str) -> Self {
        Self {
            db,
            table: quote_ident(table),
        }
    }

    pub(crate) async fn setup(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                name        TEXT PRIMARY KEY,
                token       UUID NOT NULL,
                expires_at  TIMESTAMPTZ NOT NULL
            )",
            t = self.table
        ))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Insert, or take over an expired row, in one statement.
    pub(crate) async fn acquire(&self, name: &str, ttl: Duration) -> Result<LockToken> {
        let token = LockToken::new();
        let acquired: Option<(Uuid,)> = sqlx::query_as(&format!(
            "INSERT INTO {t} AS l (name, token, expires_at)
             VALUES ($1, $2, now() + $3::float8 * interval '1 millisecond')
             ON CONFLICT (name) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE l.expires_at <= now()
             RETURNING token",
            t = self.table
        ))
        .bind(name)
        .bind(token.0)
        .bind(millis(ttl))
        .fetch_optional(self.db.pool())
        .await?;

        match acquired {
            Some((held,)) if held == token.0 => Ok(token),
            _ => Err(Error::AlreadyLocked {
                name: name.to_string(),
            }),
        }
    }

    pub(crate) async fn renew(&self, name: &str, token: &LockToken, ttl: Duration) -> Result<Lock> {
        let renewed: Option<(DateTime<Utc>,)> = sqlx::query_as(&format!(
            "UPDATE {t}
             SET expires_at = now() + $3::float8 * interval '1 millisecond'
             WHERE name = $1 AND token = $2 AND expires_at > now()
             RETURNING expires_at",
            t = self.table
        ))
        .bind(name)
        .bind(token.0)
        .bind(millis(ttl))
        .fetch_optional(self.db.pool())
        .await?;

        renewed
            .map(|(expires_at,)| Lock {
                name: name.to_string(),
                token: *token,
                expires_at,
            })
            .ok_or_else(|| Error::LockExpiredOrStolen {
                name: name.to_string(),
            })
    }

    pub(crate) async fn release(&self, name: &str, token: &LockToken) -> Result<()> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM {t} WHERE name = $1 AND (token = $2 OR expires_at <= now())",
            t = self.table
        ))
        .bind(name)
        .bind(token.0)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        if deleted > 0 {
            return Ok(());
        }

        let held_by_other: Option<(i32,)> = sqlx::query_as(&format!(
            "SELECT 1 FROM {t} WHERE name = $1 AND expires_at > now()",
            t = self.table
        ))
        .bind(name)
        .fetch_optional(self.db.pool())
        .await?;

        match held_by_other {
            Some(_) => Err(Error::LockExpiredOrStolen {
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }
}
