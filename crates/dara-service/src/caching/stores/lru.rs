use std::fmt;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use super::{CacheError, CacheWeight, PolicyStore, SizeTracker, not_found};

#[derive(Debug)]
struct Node<V> {
    key: String,
    value: V,
    pin: bool,
    /// Towards the most recently used end.
    prev: Option<usize>,
    /// Towards the least recently used end.
    next: Option<usize>,
}

/// A recency list threaded through a slab of nodes, indexed by key.
#[derive(Debug)]
struct LruList<V> {
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    index: FxHashMap<String, usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

impl<V> Default for LruList<V> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: FxHashMap::default(),
            head: None,
            tail: None,
        }
    }
}

impl<V> LruList<V> {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&self, idx: usize) -> &Node<V> {
        self.nodes[idx].as_ref().expect("linked node must be occupied")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<V> {
        self.nodes[idx].as_mut().expect("linked node must be occupied")
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(old_head) => self.node_mut(old_head).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn insert_front(&mut self, key: String, value: V, pin: bool) {
        let node = Node {
            key: key.clone(),
            value,
            pin,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    fn remove(&mut self, idx: usize) -> Node<V> {
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("linked node must be occupied");
        self.index.remove(&node.key);
        self.free.push(idx);
        node
    }

    /// Finds the least recently used node which is not pinned.
    fn eviction_candidate(&self) -> Option<usize> {
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            let node = self.node(idx);
            if !node.pin {
                return Some(idx);
            }
            cursor = node.prev;
        }
        None
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }
}

/// A store keeping at most `max_size` values, evicting the least recently used ones first.
///
/// Pinned values are skipped by eviction. If every value is pinned, nothing is evicted and the
/// store may grow beyond `max_size`.
pub struct LruStore<V> {
    max_size: usize,
    list: Mutex<LruList<V>>,
    size: SizeTracker,
}

impl<V> LruStore<V> {
    pub fn new(max_size: usize, size: SizeTracker) -> Self {
        Self {
            max_size,
            list: Default::default(),
            size,
        }
    }
}

impl<V> fmt::Debug for LruStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.list.try_lock().map(|l| l.len()).unwrap_or_default();
        f.debug_struct("LruStore")
            .field("max_size", &self.max_size)
            .field("len", &len)
            .finish()
    }
}

impl<V: CacheWeight> LruStore<V> {
    /// Evicts unpinned values, least recently used first, until at most `max_size` remain.
    fn evict_overflow(&self, list: &mut LruList<V>) {
        while list.len() > self.max_size {
            let Some(idx) = list.eviction_candidate() else {
                tracing::trace!(
                    max_size = self.max_size,
                    len = list.len(),
                    "all entries are pinned, skipping eviction"
                );
                break;
            };
            let evicted = list.remove(idx);
            self.size.sub(&evicted.value);
        }
    }
}

impl<V> PolicyStore<V> for LruStore<V>
where
    V: CacheWeight + Clone + Send + Sync + fmt::Debug,
{
    fn get(&self, key: &str, unpin: bool, raise_for_missing: bool) -> Result<Option<V>, CacheError> {
        let mut list = self.list.lock().unwrap();
        let Some(&idx) = list.index.get(key) else {
            return match raise_for_missing {
                true => Err(not_found(key)),
                false => Ok(None),
            };
        };

        list.move_to_front(idx);
        let node = list.node_mut(idx);
        if unpin {
            node.pin = false;
        }
        Ok(Some(node.value.clone()))
    }

    fn set(&self, key: &str, value: V, pin: bool) -> Option<V> {
        let mut list = self.list.lock().unwrap();
        self.size.add(&value);

        if let Some(&idx) = list.index.get(key) {
            list.move_to_front(idx);
            let node = list.node_mut(idx);
            node.pin |= pin;
            let previous = std::mem::replace(&mut node.value, value);
            self.size.sub(&previous);
            return Some(previous);
        }

        list.insert_front(key.to_owned(), value, pin);
        self.evict_overflow(&mut list);
        None
    }

    fn replace(&self, key: &str, value: V) -> Option<V> {
        let mut list = self.list.lock().unwrap();
        self.size.add(&value);

        let Some(&idx) = list.index.get(key) else {
            list.insert_front(key.to_owned(), value, false);
            self.evict_overflow(&mut list);
            return None;
        };

        list.move_to_front(idx);
        let node = list.node_mut(idx);
        node.pin = false;
        let previous = std::mem::replace(&mut node.value, value);
        self.size.sub(&previous);
        // pins may have held the store above its bound
        self.evict_overflow(&mut list);
        Some(previous)
    }

    fn delete(&self, key: &str) -> Option<V> {
        let mut list = self.list.lock().unwrap();
        let idx = *list.index.get(key)?;
        let node = list.remove(idx);
        self.size.sub(&node.value);
        Some(node.value)
    }

    fn clear(&self) {
        let mut list = self.list.lock().unwrap();
        for node in list.nodes.iter().flatten() {
            self.size.sub(&node.value);
        }
        list.clear();
    }

    fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_size: usize) -> LruStore<u64> {
        LruStore::new(max_size, SizeTracker::default())
    }

    #[test]
    fn test_evicts_least_recently_inserted() {
        let store = store(3);
        store.set("a", 1, false);
        store.set("b", 2, false);
        store.set("c", 3, false);
        store.set("d", 4, false);

        assert_eq!(store.get("a", false, false), Ok(None));
        assert_eq!(store.get("b", false, false), Ok(Some(2)));
        assert_eq!(store.get("c", false, false), Ok(Some(3)));
        assert_eq!(store.get("d", false, false), Ok(Some(4)));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_get_promotes() {
        let store = store(2);
        store.set("a", 1, false);
        store.set("b", 2, false);

        // touching `a` makes `b` the least recently used
        assert_eq!(store.get("a", false, false), Ok(Some(1)));
        store.set("c", 3, false);

        assert_eq!(store.get("a", false, false), Ok(Some(1)));
        assert_eq!(store.get("b", false, false), Ok(None));
        assert_eq!(store.get("c", false, false), Ok(Some(3)));
    }

    #[test]
    fn test_pinned_never_evicted() {
        let store = store(2);
        store.set("pinned", 0, true);
        store.set("a", 1, false);
        store.set("b", 2, false);
        store.set("c", 3, false);

        assert_eq!(store.get("pinned", false, false), Ok(Some(0)));
        assert_eq!(store.get("a", false, false), Ok(None));
        assert_eq!(store.get("b", false, false), Ok(None));
        assert_eq!(store.get("c", false, false), Ok(Some(3)));
    }

    #[test]
    fn test_all_pinned_exceeds_max_size() {
        let store = store(2);
        store.set("a", 1, true);
        store.set("b", 2, true);
        store.set("c", 3, true);

        assert_eq!(store.len(), 3);
        for key in ["a", "b", "c"] {
            assert!(store.get(key, false, false).unwrap().is_some());
        }
    }

    #[test]
    fn test_unpin_makes_evictable() {
        let store = store(1);
        store.set("a", 1, true);
        store.set("b", 2, false);
        // `b` was the only candidate, `a` stays pinned
        assert_eq!(store.get("b", false, false), Ok(None));

        assert_eq!(store.get("a", true, false), Ok(Some(1)));
        store.set("c", 3, false);
        assert_eq!(store.get("a", false, false), Ok(None));
        assert_eq!(store.get("c", false, false), Ok(Some(3)));
    }

    #[test]
    fn test_replace_drops_pin() {
        let store = store(1);
        store.set("a", 1, true);
        store.set("b", 2, false);
        assert_eq!(store.get("a", false, false), Ok(Some(1)));

        // a plain set keeps the pin, `b` is the one evicted again
        store.set("a", 10, false);
        store.set("b", 2, false);
        assert_eq!(store.get("a", false, false), Ok(Some(10)));
        assert_eq!(store.get("b", false, false), Ok(None));

        assert_eq!(store.replace("a", 11), Some(10));
        store.set("b", 2, false);
        assert_eq!(store.get("a", false, false), Ok(None));
        assert_eq!(store.get("b", false, false), Ok(Some(2)));
    }

    #[test]
    fn test_replace_evicts_overflow() {
        let store = store(1);
        store.set("a", 1, true);
        store.set("b", 2, true);
        assert_eq!(store.len(), 2);

        store.replace("b", 3);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a", false, false), Ok(Some(1)));
    }

    #[test]
    fn test_most_recent() {
        let store = store(1);
        store.set("a", 1, false);
        store.set("b", 2, false);

        assert_eq!(store.get("a", false, false), Ok(None));
        assert_eq!(store.get("b", false, false), Ok(Some(2)));
    }

    #[test]
    fn test_overwrite_returns_previous() {
        let store = store(2);
        assert_eq!(store.set("a", 1, false), None);
        assert_eq!(store.set("a", 2, false), Some(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_and_reuse_slots() {
        let size = SizeTracker::default();
        let store = LruStore::new(2, size.clone());
        store.set("a", 1u64, false);
        store.set("b", 2, false);
        assert_eq!(store.delete("a"), Some(1));
        assert_eq!(store.delete("a"), None);

        store.set("c", 3, false);
        store.set("d", 4, false);
        assert_eq!(store.get("b", false, false), Ok(None));
        assert_eq!(store.get("c", false, false), Ok(Some(3)));
        assert_eq!(store.get("d", false, false), Ok(Some(4)));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(size.get(), 0);
    }

    #[test]
    fn test_raise_for_missing() {
        let store = store(1);
        assert_eq!(
            store.get("a", false, true),
            Err(CacheError::NotFound("a".into()))
        );
    }
}
