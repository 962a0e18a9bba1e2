use kube::runtime::watcher::Event;
use std::collections::{BTreeMap, btree_map};

/// Domain projection of a watched Kubernetes object.
pub trait KeyValueFrom<V>: Sized {
    type Key: Ord;
    fn key_from(v: &V) -> Option<Self::Key>;
    fn value_from(v: &V) -> Option<Self>;
}

/// Keyed store fed by a kube watcher; `ready` flips once the initial list is
/// complete, so consumers don't act on a partial view of the cluster.
pub struct Map<F, T: KeyValueFrom<F>> {
    map: BTreeMap<T::Key, T>,
    ready: bool,
}

impl<F, T: KeyValueFrom<F>> Map<F, T> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.map.get(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, T::Key, T> {
        self.map.iter()
    }

    pub fn ingest(&mut self, event: Event<F>) {
        use Event::*;
        match event {
            Init => {
                self.map.clear();
                self.ready = false
            }
            InitApply(v) | Apply(v) => {
                if let (Some(key), Some(value)) = (T::key_from(&v), T::value_from(&v)) {
                    self.map.insert(key, value);
                }
            }
            InitDone => self.ready = true,
            Delete(v) => {
                if let Some(key) = T::key_from(&v) {
                    self.map.remove(&key);
                }
            }
        }
    }
}

impl<F, T: KeyValueFrom<F>> Default for Map<F, T> {
    fn default() -> Self {
        Self::new()
    }
}
