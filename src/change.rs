use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Last applied value per key, across apply rounds. Drives both
/// skip-if-unchanged (re-applying an identical ruleset is a no-op without
/// touching the kernel) and cleanup-on-delete (keys that were applied but are
/// no longer desired).
///
/// Failed operations simply don't update the tracker, so they are retried on
/// the next round.
#[derive(Debug, Default)]
pub struct Tracker<K: Ord, V: Eq> {
    applied: Map<K, V>,
}

impl<K: Ord + Clone, V: Eq> Tracker<K, V> {
    pub fn new() -> Self {
        Self { applied: Map::new() }
    }

    /// true when `value` is exactly what was last applied for `key`
    pub fn is_current(&self, key: &K, value: &V) -> bool {
        self.applied.get(key) == Some(value)
    }

    /// record a successful apply
    pub fn record(&mut self, key: K, value: V) {
        self.applied.insert(key, value);
    }

    /// record a successful cleanup
    pub fn forget(&mut self, key: &K) {
        self.applied.remove(key);
    }

    /// keys applied earlier but absent from the desired set
    pub fn stale_keys(&self, desired: &Set<K>) -> Vec<K> {
        (self.applied.keys())
            .filter(|k| !desired.contains(k))
            .cloned()
            .collect()
    }
}
