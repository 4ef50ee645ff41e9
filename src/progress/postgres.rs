use crate::db::{Db, quote_ident};
use crate::error::Result;

#[derive(Clone)]
pub struct PgProgressStore {
    db: Db,
    table: String,
    allow_resets: bool,
}

impl PgProgressStore {
    pub fn new(db: Db, table: &str, allow_resets: bool) -> Self {
        Self {
            db,
            table: quote_ident(table),
            allow_resets,
        }
    }

    pub(crate) async fn setup(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                consumer_name  TEXT NOT NULL,
                partition      TEXT NOT NULL,
                position       BIGINT NOT NULL,
                updated_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (consumer_name, partition)
            )",
            t = self.table
        ))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub(crate) async fn get(&self, consumer: &str, partition: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT position FROM {t} WHERE consumer_name = $1 AND partition = $2",
            t = self.table
        ))
        .bind(consumer)
        .bind(partition)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|(position,)| position))
    }

    /// Upsert guarded by `position < EXCLUDED.position`, so the comparison
    /// and the write happen under the row lock.
    pub(crate) async fn set(&self, consumer: &str, partition: &str, position: i64) -> Result<i64> {
        let guard = if self.allow_resets {
            ""
        } else {
            "WHERE p.position < EXCLUDED.position"
        };
        let written: Option<(i64,)> = sqlx::query_as(&format!(
            "INSERT INTO {t} AS p (consumer_name, partition, position)
             VALUES ($1, $2, $3)
             ON CONFLICT (consumer_name, partition) DO UPDATE
                SET position = EXCLUDED.position, updated_at = now()
                {guard}
             RETURNING position",
            t = self.table
        ))
        .bind(consumer)
        .bind(partition)
        .bind(position)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some((position,)) = written {
            return Ok(position);
        }
        let current = self.get(consumer, partition).await?.unwrap_or(i64::MIN);
        Err(super::regression(consumer, partition, current, position))
    }

    pub(crate) async fn reset(&self, consumer: &str) -> Result<u64> {
        let cleared = sqlx::query(&format!(
            "DELETE FROM {t} WHERE consumer_name = $1",
            t = self.table
        ))
        .bind(consumer)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(cleared)
    }
}
