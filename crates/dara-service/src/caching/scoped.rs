use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::stores::{self, PolicyStore, SizeTracker};
use super::{CacheError, CachePolicy, CacheScope, CacheWeight};

/// The cache of a single registry entry, partitioned by [`CacheScope`].
///
/// Every scope gets its own store implementing the entry's policy, so an LRU policy of size 3 on
/// a session cache keeps three values per session. Stores are created on the first `set` into a
/// scope.
pub struct ScopedCache<V> {
    policy: CachePolicy,
    stores: Mutex<HashMap<CacheScope, Arc<dyn PolicyStore<V>>>>,
    size: SizeTracker,
}

impl<V> ScopedCache<V>
where
    V: CacheWeight + Clone + Send + Sync + fmt::Debug + 'static,
{
    pub fn new(policy: CachePolicy, size: SizeTracker) -> Self {
        Self {
            policy,
            stores: Default::default(),
            size,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn store(&self, scope: &CacheScope) -> Option<Arc<dyn PolicyStore<V>>> {
        self.stores.lock().unwrap().get(scope).cloned()
    }

    fn store_or_create(&self, scope: &CacheScope) -> Arc<dyn PolicyStore<V>> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get(scope) {
            return Arc::clone(store);
        }

        tracing::trace!(%scope, policy = ?self.policy.kind, "creating cache store for scope");
        let store = stores::for_policy(self.policy.kind, self.size.clone());
        stores.insert(scope.clone(), Arc::clone(&store));
        store
    }

    pub fn get(
        &self,
        scope: &CacheScope,
        key: &str,
        unpin: bool,
        raise_for_missing: bool,
    ) -> Result<Option<V>, CacheError> {
        match self.store(scope) {
            Some(store) => store.get(key, unpin, raise_for_missing),
            None if raise_for_missing => Err(CacheError::NotFound(key.to_owned())),
            None => Ok(None),
        }
    }

    /// Stores `value` in the given scope, returning the value it replaced.
    pub fn set(&self, scope: &CacheScope, key: &str, value: V, pin: bool) -> Option<V> {
        self.store_or_create(scope).set(key, value, pin)
    }

    /// Stores `value` unpinned in the given scope, see [`PolicyStore::replace`].
    pub fn replace(&self, scope: &CacheScope, key: &str, value: V) -> Option<V> {
        self.store_or_create(scope).replace(key, value)
    }

    pub fn delete(&self, scope: &CacheScope, key: &str) -> Option<V> {
        self.store(scope)?.delete(key)
    }

    /// Removes every value in every scope.
    pub fn clear(&self) {
        let stores = std::mem::take(&mut *self.stores.lock().unwrap());
        for store in stores.values() {
            store.clear();
        }
    }

    /// The number of scopes that have a store.
    pub fn scopes(&self) -> usize {
        self.stores.lock().unwrap().len()
    }
}

impl<V> fmt::Debug for ScopedCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCache")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
