//! Bounded `NodeID -> decoded node` cache with pinning (spec §4.5).
//!
//! The teacher's own cache (`src/clru/`) is a lock-free sharded map with an
//! atomic-pointer access list; spec §5 instead calls for "the cache uses a
//! mutex on its LRU list", so this is a single `Mutex`-guarded structure in
//! the same get/add/pin/unpin shape as `clru::Lru` (`src/clru/lru.rs`) but
//! without its concurrent-map machinery — a deliberate simplification, see
//! DESIGN.md.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::NodeId;

struct Entry<T> {
    value: Arc<Mutex<T>>,
    pins: u32,
}

struct Inner<T> {
    entries: HashMap<NodeId, Entry<T>>,
    /// Most-recently-used first. A linear scan to move an id to the front
    /// is acceptable at this cache's scale (bounded by the working set, not
    /// the whole tree).
    recency: Vec<NodeId>,
    capacity: usize,
}

impl<T> Inner<T> {
    fn touch(&mut self, id: NodeId) {
        if let Some(pos) = self.recency.iter().position(|&x| x == id) {
            self.recency.remove(pos);
        }
        self.recency.insert(0, id);
    }

    fn evict_if_over_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let victim = self
                .recency
                .iter()
                .rev()
                .find(|id| self.entries.get(id).map(|e| e.pins == 0).unwrap_or(false))
                .copied();
            match victim {
                Some(id) => {
                    self.entries.remove(&id);
                    self.recency.retain(|x| *x != id);
                }
                None => break, // everything is pinned; over capacity is tolerated
            }
        }
    }
}

/// A bounded cache of decoded nodes, keyed by [NodeId]. Values are
/// `Arc<Mutex<T>>` so the bucket module can mutate a cached node in place
/// (under the façade's single-writer discipline) while iterators hold
/// shared references.
pub struct Cache<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Cache<T> {
    pub fn new(capacity: usize) -> Cache<T> {
        Cache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: Vec::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Mutex<T>>> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.entries.get(&id).map(|e| Arc::clone(&e.value));
        if value.is_some() {
            inner.touch(id);
        }
        value
    }

    /// Insert a freshly decoded node, evicting unpinned entries if the
    /// cache is over capacity.
    pub fn add(&self, id: NodeId, value: T) -> Arc<Mutex<T>> {
        let arc = Arc::new(Mutex::new(value));
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            id,
            Entry {
                value: Arc::clone(&arc),
                pins: 0,
            },
        );
        inner.touch(id);
        inner.evict_if_over_capacity();
        arc
    }

    /// Force a reload on next access, used after an external durable-mode
    /// commit invalidates the façade's cached view.
    pub fn invalidate(&self, id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(&id);
        inner.recency.retain(|x| *x != id);
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Pin `id` so it cannot be evicted. A no-op if `id` is not present —
    /// callers are expected to `add` or `get` first.
    pub fn pin(&self, id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = inner.entries.get_mut(&id) {
            e.pins += 1;
        }
    }

    pub fn unpin(&self, id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = inner.entries.get_mut(&id) {
            if e.pins > 0 {
                e.pins -= 1;
            }
        }
    }

    pub fn is_pinned(&self, id: NodeId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&id)
            .map(|e| e.pins > 0)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get_round_trip() {
        let cache: Cache<u32> = Cache::new(2);
        cache.add(NodeId(1), 42);
        let got = cache.get(NodeId(1)).unwrap();
        assert_eq!(*got.lock().unwrap(), 42);
    }

    #[test]
    fn evicts_least_recently_used_when_unpinned() {
        let cache: Cache<u32> = Cache::new(2);
        cache.add(NodeId(1), 1);
        cache.add(NodeId(2), 2);
        cache.get(NodeId(1)); // 1 is now most recent
        cache.add(NodeId(3), 3); // should evict 2, not 1
        assert!(cache.get(NodeId(1)).is_some());
        assert!(cache.get(NodeId(2)).is_none());
        assert!(cache.get(NodeId(3)).is_some());
    }

    #[test]
    fn pinned_entries_survive_eviction_pressure() {
        let cache: Cache<u32> = Cache::new(1);
        cache.add(NodeId(1), 1);
        cache.pin(NodeId(1));
        cache.add(NodeId(2), 2);
        assert!(cache.get(NodeId(1)).is_some());
        cache.unpin(NodeId(1));
        cache.add(NodeId(3), 3);
        assert!(cache.get(NodeId(1)).is_none());
    }

    #[test]
    fn invalidate_forces_reload() {
        let cache: Cache<u32> = Cache::new(4);
        cache.add(NodeId(1), 1);
        cache.invalidate(NodeId(1));
        assert!(cache.get(NodeId(1)).is_none());
    }
}
