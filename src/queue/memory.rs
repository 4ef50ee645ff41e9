use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::Expiry;
use crate::error::{Error, Result};
use crate::model::{Item, ItemId, Lease, LeaseToken, LeasedItem, NewItem, QueueStats, deadline};

/// Queue state held in this process. One mutex guards everything, which
/// makes select-and-lease a single atomic step.
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    entries: HashMap<String, Entry>,
    dedup_keys: HashSet<String>,
    /// token -> discriminator, for lookups by lease token.
    leases: HashMap<LeaseToken, String>,
}

/// One discriminator's sub-queue.
struct Entry {
    items: VecDeque<Item>,
    lease: Option<Lease>,
    /// Deferred entries sit out until this instant.
    available_at: DateTime<Utc>,
}

impl Entry {
    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.items.is_empty()
            && self.available_at <= now
            && !self.lease.as_ref().is_some_and(|lease| lease.is_live_at(now))
    }
}

impl State {
    /// The live lease for `token` and its discriminator.
    fn live_lease(&mut self, token: &LeaseToken, now: DateTime<Utc>) -> Result<(String, &mut Entry)> {
        let discriminator = self
            .leases
            .get(token)
            .cloned()
            .ok_or(Error::LeaseExpiredOrStolen)?;
        let entry = self
            .entries
            .get_mut(&discriminator)
            .filter(|entry| {
                entry
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.token == *token && lease.is_live_at(now))
            })
            .ok_or(Error::LeaseExpiredOrStolen)?;
        Ok((discriminator, entry))
    }
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&self, new: NewItem) -> Result<Item> {
        let mut state = self.state();
        let now = Utc::now();

        if let Some(key) = &new.dedup_key
            && state.dedup_keys.contains(key)
        {
            return Err(Error::DuplicateItem {
                dedup_key: key.clone(),
            });
        }

        state.next_id += 1;
        let item = new.into_item(ItemId(state.next_id), now);
        if let Some(key) = &item.dedup_key {
            state.dedup_keys.insert(key.clone());
        }
        state
            .entries
            .entry(item.unit.discriminator.clone())
            .or_insert_with(|| Entry {
                items: VecDeque::new(),
                lease: None,
                available_at: now,
            })
            .items
            .push_back(item.clone());
        Ok(item)
    }

    pub(crate) fn lease(&self, worker_id: &str, ttl: Duration) -> Result<Option<LeasedItem>> {
        let mut state = self.state();
        let now = Utc::now();

        let picked = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_eligible(now))
            .filter_map(|(discriminator, entry)| entry.items.front().map(|head| (discriminator, head)))
            .min_by_key(|(_, head)| (head.priority, head.enqueued_at, head.id))
            .map(|(discriminator, _)| discriminator.clone());
        let Some(discriminator) = picked else {
            return Ok(None);
        };

        let lease = Lease {
            token: LeaseToken::new(),
            worker_id: worker_id.to_string(),
            expires_at: deadline(now, ttl),
        };
        let Some(entry) = state.entries.get_mut(&discriminator) else {
            return Ok(None);
        };
        let Some(item) = entry.items.front().cloned() else {
            return Ok(None);
        };
        let stale = entry.lease.replace(lease.clone());

        if let Some(stale) = stale {
            state.leases.remove(&stale.token);
        }
        state.leases.insert(lease.token, discriminator);
        Ok(Some(LeasedItem { item, lease }))
    }

    pub(crate) fn renew(&self, token: &LeaseToken, expiry: Expiry) -> Result<Lease> {
        let mut state = self.state();
        let now = Utc::now();
        let (_, entry) = state.live_lease(token, now)?;
        let Some(lease) = entry.lease.as_mut() else {
            return Err(Error::LeaseExpiredOrStolen);
        };

        let target = match expiry {
            Expiry::At(at) => at,
            Expiry::After(ttl) => deadline(now, ttl),
        };
        if target <= lease.expires_at {
            return Err(Error::LeaseNotExtended {
                current: lease.expires_at,
            });
        }
        lease.expires_at = target;
        Ok(lease.clone())
    }

    pub(crate) fn acknowledge(&self, token: &LeaseToken) -> Result<Item> {
        let mut state = self.state();
        let now = Utc::now();
        let (discriminator, entry) = state.live_lease(token, now)?;

        let Some(item) = entry.items.pop_front() else {
            return Err(Error::LeaseExpiredOrStolen);
        };
        entry.lease = None;
        entry.available_at = now;
        let drained = entry.items.is_empty();

        if drained {
            state.entries.remove(&discriminator);
        }
        state.leases.remove(token);
        if let Some(key) = &item.dedup_key {
            state.dedup_keys.remove(key);
        }
        Ok(item)
    }

    /// Returns the discriminator whose lease was released.
    pub(crate) fn defer(&self, token: &LeaseToken, delay: Duration) -> Result<String> {
        let mut state = self.state();
        let now = Utc::now();
        let (discriminator, entry) = state.live_lease(token, now)?;
        entry.lease = None;
        entry.available_at = deadline(now, delay);
        state.leases.remove(token);
        Ok(discriminator)
    }

    pub(crate) fn sweep_expired(&self) -> Result<Vec<String>> {
        let mut state = self.state();
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        let mut stale_tokens = Vec::new();

        for (discriminator, entry) in state.entries.iter_mut() {
            if let Some(lease) = entry.lease.take_if(|lease| !lease.is_live_at(now)) {
                stale_tokens.push(lease.token);
                reclaimed.push(discriminator.clone());
            }
        }
        for token in stale_tokens {
            state.leases.remove(&token);
        }
        reclaimed.sort();
        Ok(reclaimed)
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let state = self.state();
        let now = Utc::now();
        QueueStats {
            discriminators: state.entries.len() as u64,
            pending_items: state.entries.values().map(|e| e.items.len() as u64).sum(),
            active_leases: state
                .entries
                .values()
                .filter(|e| e.lease.as_ref().is_some_and(|lease| lease.is_live_at(now)))
                .count() as u64,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
