use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use super::{CacheError, CacheWeight, PolicyStore, SizeTracker, not_found};

#[derive(Debug)]
struct Node<V> {
    value: V,
    expiration_time: Instant,
}

#[derive(Debug)]
struct TtlState<V> {
    /// Values exempt from expiry. They keep their original expiration time for when they are
    /// unpinned again.
    pinned: FxHashMap<String, Node<V>>,
    unpinned: FxHashMap<String, Node<V>>,
    /// Expiration times of unpinned values, soonest first.
    ///
    /// Entries are never removed eagerly. An entry is stale if its key is no longer unpinned
    /// with the same expiration time, and stale entries are skipped when popped.
    expirations: BinaryHeap<Reverse<(Instant, String)>>,
}

impl<V> Default for TtlState<V> {
    fn default() -> Self {
        Self {
            pinned: FxHashMap::default(),
            unpinned: FxHashMap::default(),
            expirations: BinaryHeap::new(),
        }
    }
}

impl<V: CacheWeight> TtlState<V> {
    /// Drops every unpinned value whose expiration time is not after `now`.
    fn evict_expired(&mut self, now: Instant, size: &SizeTracker) {
        while let Some(Reverse((expiration_time, _))) = self.expirations.peek() {
            if *expiration_time > now {
                break;
            }
            let Some(Reverse((expiration_time, key))) = self.expirations.pop() else {
                break;
            };
            let is_current = self
                .unpinned
                .get(&key)
                .is_some_and(|node| node.expiration_time == expiration_time);
            if is_current {
                if let Some(node) = self.unpinned.remove(&key) {
                    size.sub(&node.value);
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<Node<V>> {
        self.unpinned
            .remove(key)
            .or_else(|| self.pinned.remove(key))
    }

    fn insert_unpinned(&mut self, key: String, node: Node<V>) {
        self.expirations
            .push(Reverse((node.expiration_time, key.clone())));
        self.unpinned.insert(key, node);
    }
}

/// A store evicting values a fixed `ttl` after they were last set.
///
/// Expiry is evaluated lazily at the start of every operation, there is no background timer.
/// Pinned values never expire. Unpinning a value does not refresh its expiration time.
pub struct TtlStore<V> {
    ttl: Duration,
    state: Mutex<TtlState<V>>,
    size: SizeTracker,
}

impl<V> TtlStore<V> {
    pub fn new(ttl: Duration, size: SizeTracker) -> Self {
        Self {
            ttl,
            state: Default::default(),
            size,
        }
    }
}

impl<V> fmt::Debug for TtlStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pinned, unpinned) = self
            .state
            .try_lock()
            .map(|s| (s.pinned.len(), s.unpinned.len()))
            .unwrap_or_default();
        f.debug_struct("TtlStore")
            .field("ttl", &self.ttl)
            .field("pinned", &pinned)
            .field("unpinned", &unpinned)
            .finish()
    }
}

impl<V> PolicyStore<V> for TtlStore<V>
where
    V: CacheWeight + Clone + Send + Sync + fmt::Debug,
{
    fn get(&self, key: &str, unpin: bool, raise_for_missing: bool) -> Result<Option<V>, CacheError> {
        let mut state = self.state.lock().unwrap();
        state.evict_expired(Instant::now(), &self.size);

        if let Some(node) = state.unpinned.get(key) {
            return Ok(Some(node.value.clone()));
        }

        if unpin {
            if let Some(node) = state.pinned.remove(key) {
                let value = node.value.clone();
                state.insert_unpinned(key.to_owned(), node);
                return Ok(Some(value));
            }
        } else if let Some(node) = state.pinned.get(key) {
            return Ok(Some(node.value.clone()));
        }

        match raise_for_missing {
            true => Err(not_found(key)),
            false => Ok(None),
        }
    }

    fn set(&self, key: &str, value: V, pin: bool) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.evict_expired(now, &self.size);

        let previous = state.remove(key).map(|node| {
            self.size.sub(&node.value);
            node.value
        });

        self.size.add(&value);
        let node = Node {
            value,
            expiration_time: now + self.ttl,
        };
        if pin {
            state.pinned.insert(key.to_owned(), node);
        } else {
            state.insert_unpinned(key.to_owned(), node);
        }

        previous
    }

    fn delete(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        state.evict_expired(Instant::now(), &self.size);

        let node = state.remove(key)?;
        self.size.sub(&node.value);
        Some(node.value)
    }

    fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        for node in state.pinned.values().chain(state.unpinned.values()) {
            self.size.sub(&node.value);
        }
        *state = TtlState::default();
    }

    fn len(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.evict_expired(Instant::now(), &self.size);
        state.pinned.len() + state.unpinned.len()
    }
}
