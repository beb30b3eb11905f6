use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::sync::{Arc, Mutex};

use super::stores::SizeTracker;
use super::{
    CacheError, CacheWeight, Identity, PendingTask, PendingValue, RegistryEntry, ScopedCache,
    WaitError,
};
use crate::metrics::{MetricsSink, StatsdSink};

/// A value held by the [`CacheStore`].
///
/// Besides ready values, the store holds placeholders for values that are still being computed,
/// so that concurrent callers asking for the same key join the computation instead of starting a
/// second one.
pub enum CacheValue<T> {
    Ready(T),
    /// An in-process computation.
    Pending(PendingValue<T>),
    /// A task running on the worker pool.
    Task(PendingTask<T>),
}

impl<T> CacheValue<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, CacheValue::Ready(_))
    }

    pub fn into_ready(self) -> Option<T> {
        match self {
            CacheValue::Ready(value) => Some(value),
            _ => None,
        }
    }
}

impl<T: Clone> CacheValue<T> {
    /// Returns the value, waiting for placeholders to resolve first.
    pub async fn resolve(self) -> Result<T, super::TaskError> {
        match self {
            CacheValue::Ready(value) => Ok(value),
            CacheValue::Pending(pending) => pending.wait().await,
            CacheValue::Task(task) => task.run().await,
        }
    }
}

impl<T: Clone> Clone for CacheValue<T> {
    fn clone(&self) -> Self {
        match self {
            CacheValue::Ready(value) => CacheValue::Ready(value.clone()),
            CacheValue::Pending(pending) => CacheValue::Pending(pending.clone()),
            CacheValue::Task(task) => CacheValue::Task(task.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CacheValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValue::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            CacheValue::Pending(pending) => f.debug_tuple("Pending").field(pending).finish(),
            CacheValue::Task(task) => f.debug_tuple("Task").field(task).finish(),
        }
    }
}

impl<T: PartialEq> PartialEq for CacheValue<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CacheValue::Ready(a), CacheValue::Ready(b)) => a == b,
            (CacheValue::Pending(a), CacheValue::Pending(b)) => a.ptr_eq(b),
            (CacheValue::Task(a), CacheValue::Task(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl<T: CacheWeight> CacheWeight for CacheValue<T> {
    fn weight(&self) -> usize {
        match self {
            CacheValue::Ready(value) => value.weight(),
            _ => size_of::<Self>(),
        }
    }
}

/// The process-wide cache shared by all registry entries.
///
/// The store owns one [`ScopedCache`] per registry entry, keyed by the entry's uid and created
/// on the first `set`. All operations are synchronous and short, only
/// [`get_or_wait`](Self::get_or_wait) suspends.
///
/// The store keeps an approximate count of the bytes it holds, see [`CacheWeight`], and publishes
/// it to its [`MetricsSink`] after every mutation.
pub struct CacheStore<T> {
    caches: Mutex<HashMap<String, Arc<ScopedCache<CacheValue<T>>>>>,
    size: SizeTracker,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> CacheStore<T>
where
    T: CacheWeight + Clone + Send + Sync + fmt::Debug + 'static,
{
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            caches: Default::default(),
            size: SizeTracker::default(),
            metrics,
        }
    }

    fn cache(&self, entry: &RegistryEntry) -> Option<Arc<ScopedCache<CacheValue<T>>>> {
        self.caches.lock().unwrap().get(entry.uid()).cloned()
    }

    fn cache_or_create(
        &self,
        entry: &RegistryEntry,
    ) -> Result<Arc<ScopedCache<CacheValue<T>>>, CacheError> {
        let policy = *entry.policy()?;
        let mut caches = self.caches.lock().unwrap();
        let cache = caches
            .entry(entry.uid().to_owned())
            .or_insert_with(|| Arc::new(ScopedCache::new(policy, self.size.clone())));
        if *cache.policy() != policy {
            tracing::warn!(
                uid = entry.uid(),
                "registry entry changed its cache policy, keeping the original one"
            );
        }
        Ok(Arc::clone(cache))
    }

    fn publish(&self) {
        self.metrics.update_store(self.size.get());
    }

    /// Stores `value` under `key` in the entry's cache, returning the value it replaced.
    ///
    /// If a ready value replaces a placeholder that has not resolved yet, the placeholder is
    /// resolved with it, so everyone waiting on it receives the value.
    pub fn set(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
        value: CacheValue<T>,
        pin: bool,
    ) -> Result<Option<CacheValue<T>>, CacheError> {
        self.store(entry, identity, key, value, Some(pin))
    }

    /// Stores the result of a computation under `key`, replacing its placeholder.
    ///
    /// Unlike [`set`](Self::set), the value is always stored unpinned, so the pin protecting the
    /// placeholder from eviction is released in the same step.
    pub fn fulfill(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
        value: T,
    ) -> Result<Option<CacheValue<T>>, CacheError> {
        self.store(entry, identity, key, CacheValue::Ready(value), None)
    }

    /// Stores `value` pinned as requested, or unpinned replacing any pin with `pin: None`.
    fn store(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
        value: CacheValue<T>,
        pin: Option<bool>,
    ) -> Result<Option<CacheValue<T>>, CacheError> {
        let scope = entry.scope(identity)?;
        let cache = self.cache_or_create(entry)?;

        let ready = match &value {
            CacheValue::Ready(value) => Some(value.clone()),
            _ => None,
        };
        let previous = match pin {
            Some(pin) => cache.set(&scope, key, value, pin),
            None => cache.replace(&scope, key, value),
        };
        self.publish();

        if let Some(ready) = ready {
            match &previous {
                Some(CacheValue::Task(task)) if !task.is_resolved() => {
                    tracing::trace!(task_id = task.task_id(), key, "resolving pending task");
                    task.resolve(ready);
                }
                Some(CacheValue::Pending(pending)) if !pending.is_resolved() => {
                    pending.resolve(ready);
                }
                _ => {}
            }
        }

        Ok(previous)
    }

    /// Stores a fresh [`PendingValue`] under `key` and returns it.
    ///
    /// The placeholder is pinned, it cannot be evicted or expire while its computation runs.
    /// [`fulfill`](Self::fulfill) or [`delete`](Self::delete) release it.
    pub fn set_pending_value(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
    ) -> Result<PendingValue<T>, CacheError> {
        let pending = PendingValue::new();
        self.set(entry, identity, key, CacheValue::Pending(pending.clone()), true)?;
        Ok(pending)
    }

    /// Stores a fresh [`PendingTask`] for `task_id` under `key` and returns it.
    ///
    /// Pinned like the placeholder of [`set_pending_value`](Self::set_pending_value).
    pub fn set_pending_task(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
        task_id: &str,
    ) -> Result<PendingTask<T>, CacheError> {
        let task = PendingTask::new(task_id);
        self.set(entry, identity, key, CacheValue::Task(task.clone()), true)?;
        Ok(task)
    }

    /// Looks up `key` in the entry's cache.
    ///
    /// Placeholders are returned as they are, use [`get_or_wait`](Self::get_or_wait) to wait for
    /// them.
    pub fn get(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
        unpin: bool,
        raise_for_missing: bool,
    ) -> Result<Option<CacheValue<T>>, CacheError> {
        let scope = entry.scope(identity)?;
        match self.cache(entry) {
            Some(cache) => cache.get(&scope, key, unpin, raise_for_missing),
            None if raise_for_missing => Err(CacheError::NotFound(key.to_owned())),
            None => Ok(None),
        }
    }

    /// Looks up `key`, waiting for a placeholder to resolve.
    pub async fn get_or_wait(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
    ) -> Result<Option<T>, WaitError> {
        match self.get(entry, identity, key, false, false)? {
            Some(value) => Ok(Some(value.resolve().await?)),
            None => Ok(None),
        }
    }

    /// Removes `key` from the entry's cache, returning its value.
    pub fn delete(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
    ) -> Result<Option<CacheValue<T>>, CacheError> {
        let scope = entry.scope(identity)?;
        let Some(cache) = self.cache(entry) else {
            return Ok(None);
        };
        let previous = cache.delete(&scope, key);
        self.publish();
        Ok(previous)
    }

    /// Drops every cached value of every entry.
    pub fn clear(&self) {
        let caches = std::mem::take(&mut *self.caches.lock().unwrap());
        for cache in caches.values() {
            cache.clear();
        }
        self.size.reset();
        self.publish();
    }

    /// The approximate number of bytes held by the store.
    pub fn total_size(&self) -> usize {
        self.size.get()
    }
}

impl<T> Default for CacheStore<T>
where
    T: CacheWeight + Clone + Send + Sync + fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new(Arc::new(StatsdSink))
    }
}

impl<T> fmt::Debug for CacheStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.caches.try_lock().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("CacheStore")
            .field("entries", &entries)
            .field("size", &self.size.get())
            .finish()
    }
}
