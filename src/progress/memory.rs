use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;

type Positions = HashMap<(String, String), i64>;

#[derive(Clone, Default)]
pub struct MemoryProgressStore {
    positions: Arc<Mutex<Positions>>,
    allow_resets: bool,
}

impl MemoryProgressStore {
    pub fn new(allow_resets: bool) -> Self {
        Self {
            positions: Arc::default(),
            allow_resets,
        }
    }

    pub(crate) fn get(&self, consumer: &str, partition: &str) -> Option<i64> {
        self.positions()
            .get(&(consumer.to_string(), partition.to_string()))
            .copied()
    }

    pub(crate) fn set(&self, consumer: &str, partition: &str, position: i64) -> Result<i64> {
        let mut positions = self.positions();
        let key = (consumer.to_string(), partition.to_string());
        if let Some(&current) = positions.get(&key)
            && !self.allow_resets
            && position <= current
        {
            return Err(super::regression(consumer, partition, current, position));
        }
        positions.insert(key, position);
        Ok(position)
    }

    pub(crate) fn reset(&self, consumer: &str) -> u64 {
        let mut positions = self.positions();
        let before = positions.len();
        positions.retain(|(owner, _), _| owner != consumer);
        (before - positions.len()) as u64
    }

    fn positions(&self) -> MutexGuard<'_, Positions> {
        self.positions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn equal_position_is_a_regression() {
        let store = MemoryProgressStore::new(false);
        store.set("flow", "p0", 4).unwrap();
        let err = store.set("flow", "p0", 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProgressRegression);
    }

    #[test]
    fn partitions_and_consumers_are_independent() {
        let store = MemoryProgressStore::new(false);
        store.set("flow-a", "p0", 9).unwrap();
        store.set("flow-a", "p1", 1).unwrap();
        store.set("flow-b", "p0", 2).unwrap();

        assert_eq!(store.get("flow-a", "p0"), Some(9));
        assert_eq!(store.get("flow-a", "p1"), Some(1));
        assert_eq!(store.get("flow-b", "p0"), Some(2));
        assert_eq!(store.get("flow-b", "p1"), None);
    }

    #[test]
    fn reset_clears_only_the_named_consumer() {
        let store = MemoryProgressStore::new(false);
        store.set("flow-a", "p0", 9).unwrap();
        store.set("flow-a", "p1", 3).unwrap();
        store.set("flow-b", "p0", 2).unwrap();

        assert_eq!(store.reset("flow-a"), 2);
        assert_eq!(store.get("flow-a", "p0"), None);
        assert_eq!(store.get("flow-b", "p0"), Some(2));
        store.set("flow-a", "p0", 1).unwrap();
    }
}
