//! Cross-process bus over Postgres LISTEN/NOTIFY.
//!
//! Every message travels on one database channel as `{channel, message}`
//! JSON; a listener task re-dispatches it to this process's subscribers.
//! A publisher's own process receives its messages the same way.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{LocalBus, Notification};
use crate::db::Db;
use crate::error::{Error, Result};

/// Database channel shared by every workq process on the same database.
const PG_CHANNEL: &str = "workq_notifications";

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PgBus {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalBus,
    pool: PgPool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.listener.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

impl PgBus {
    /// LISTEN on the shared channel, then hand the listener to a background task.
    pub async fn connect(db: &Db) -> Result<Self> {
        let mut listener = PgListener::connect_with(db.pool()).await?;
        listener.listen(PG_CHANNEL).await?;

        let local = LocalBus::new();
        let task = tokio::spawn(listen_loop(listener, local.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                local,
                pool: db.pool().clone(),
                listener: Mutex::new(Some(task)),
            }),
        })
    }

    pub(crate) async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(&Notification {
            channel: channel.to_string(),
            message,
        })
        .map_err(|e| Error::Other(format!("serialize notification: {e}")))?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(PG_CHANNEL)
            .bind(payload)
            .execute(&self.inner.pool)
            .await?;
        Ok(())
    }

    pub(crate) fn local(&self) -> &LocalBus {
        &self.inner.local
    }

    pub(crate) fn close(&self) {
        let task = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.local.clear();
    }
}

async fn listen_loop(mut listener: PgListener, local: LocalBus) {
    let mut backoff = MIN_BACKOFF;
    loop {
        match listener.recv().await {
            Ok(notification) => {
                backoff = MIN_BACKOFF;
                match serde_json::from_str::<Notification>(notification.payload()) {
                    Ok(parsed) => local.dispatch(&parsed),
                    Err(e) => debug!("ignoring malformed bus payload: {e}"),
                }
            }
            Err(e) => {
                // recv() reconnects and re-LISTENs on the next call.
                warn!("bus listener error: {e}, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
