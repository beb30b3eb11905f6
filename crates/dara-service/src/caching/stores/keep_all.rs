use std::fmt;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use super::{CacheError, CacheWeight, PolicyStore, SizeTracker, not_found};

#[derive(Debug)]
struct Node<V> {
    value: V,
    pin: bool,
}

/// An unbounded store that never evicts anything.
///
/// Pins are still tracked so that they behave the same across policies, but they have no effect.
pub struct KeepAllStore<V> {
    entries: Mutex<FxHashMap<String, Node<V>>>,
    size: SizeTracker,
}

impl<V> KeepAllStore<V> {
    pub fn new(size: SizeTracker) -> Self {
        Self {
            entries: Default::default(),
            size,
        }
    }
}

impl<V> fmt::Debug for KeepAllStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.try_lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("KeepAllStore").field("len", &len).finish()
    }
}

impl<V> PolicyStore<V> for KeepAllStore<V>
where
    V: CacheWeight + Clone + Send + Sync + fmt::Debug,
{
    fn get(&self, key: &str, unpin: bool, raise_for_missing: bool) -> Result<Option<V>, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(node) => {
                if unpin {
                    node.pin = false;
                }
                Ok(Some(node.value.clone()))
            }
            None if raise_for_missing => Err(not_found(key)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: V, pin: bool) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        self.size.add(&value);
        let previous = entries.insert(key.to_owned(), Node { value, pin })?;
        self.size.sub(&previous.value);
        Some(previous.value)
    }

    fn delete(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        let node = entries.remove(key)?;
        self.size.sub(&node.value);
        Some(node.value)
    }

    fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        for node in entries.values() {
            self.size.sub(&node.value);
        }
        entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
