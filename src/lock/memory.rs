use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::model::{Lock, LockToken, deadline};

/// Locks held in this process's memory.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    locks: Arc<Mutex<HashMap<String, Lock>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self, name: &str, ttl: Duration) -> Result<LockToken> {
        let mut locks = self.locks();
        let now = Utc::now();
        if locks.get(name).is_some_and(|lock| lock.expires_at > now) {
            return Err(Error::AlreadyLocked {
                name: name.to_string(),
            });
        }

        let token = LockToken::new();
        locks.insert(
            name.to_string(),
            Lock {
                name: name.to_string(),
                token,
                expires_at: deadline(now, ttl),
            },
        );
        Ok(token)
    }

    pub(crate) fn renew(&self, name: &str, token: &LockToken, ttl: Duration) -> Result<Lock> {
        let mut locks = self.locks();
        let now = Utc::now();
        match locks.get_mut(name) {
            Some(lock) if lock.token == *token && lock.expires_at > now => {
                lock.expires_at = deadline(now, ttl);
                Ok(lock.clone())
            }
            _ => Err(Error::LockExpiredOrStolen {
                name: name.to_string(),
            }),
        }
    }

    pub(crate) fn release(&self, name: &str, token: &LockToken) -> Result<()> {
        let mut locks = self.locks();
        let now = Utc::now();
        match locks.get(name) {
            None => Ok(()),
            Some(lock) if lock.token == *token || lock.expires_at <= now => {
                locks.remove(name);
                Ok(())
            }
            Some(_) => Err(Error::LockExpiredOrStolen {
                name: name.to_string(),
            }),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Lock>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn second_acquire_is_rejected_while_held() {
        let store = MemoryLockStore::new();
        store.acquire("job-x", TTL).unwrap();
        let err = store.acquire("job-x", TTL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyLocked);
    }

    #[test]
    fn expired_record_counts_as_absent() {
        let store = MemoryLockStore::new();
        let stale = store.acquire("job-x", Duration::ZERO).unwrap();

        let fresh = store.acquire("job-x", TTL).unwrap();
        assert_ne!(stale, fresh);
        assert!(store.renew("job-x", &stale, TTL).is_err());
        assert!(store.renew("job-x", &fresh, TTL).is_ok());
    }

    #[test]
    fn renew_with_wrong_token_leaves_lock_untouched() {
        let store = MemoryLockStore::new();
        let token = store.acquire("job-x", TTL).unwrap();
        let before = store.locks().get("job-x").cloned().unwrap();

        let err = store.renew("job-x", &LockToken::new(), TTL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockExpiredOrStolen);
        assert_eq!(store.locks().get("job-x"), Some(&before));
        assert_eq!(before.token, token);
    }

    #[test]
    fn release_is_idempotent_but_guards_live_locks() {
        let store = MemoryLockStore::new();
        let token = store.acquire("job-x", TTL).unwrap();

        let err = store.release("job-x", &LockToken::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockExpiredOrStolen);

        store.release("job-x", &token).unwrap();
        store.release("job-x", &token).unwrap();
        store.acquire("job-x", TTL).unwrap();
    }
}
