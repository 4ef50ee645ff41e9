//! Process-local subscriber registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Callback, Notification, Subscription};

#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<(u64, Callback)>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self, channel: String, callback: Callback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels()
            .entry(channel.clone())
            .or_default()
            .push((id, callback));
        Subscription { channel, id }
    }

    pub(crate) fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut channels = self.channels();
        let Some(subscribers) = channels.get_mut(&subscription.channel) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription.id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            channels.remove(&subscription.channel);
        }
        removed
    }

    /// Invoke every callback registered on the notification's channel.
    pub(crate) fn dispatch(&self, notification: &Notification) {
        // Snapshot first so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .channels()
            .get(&notification.channel)
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in callbacks {
            callback(notification);
        }
    }

    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.channels().get(channel).map_or(0, Vec::len)
    }

    pub(crate) fn clear(&self) {
        self.channels().clear();
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Callback)>>> {
        // A panicking callback never runs under this lock, so poisoning
        // cannot leave the map half-updated.
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
