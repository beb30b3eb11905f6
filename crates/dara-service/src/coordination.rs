//! At-most-once computation of cached values.
//!
//! The [`Coordinator`] makes sure that for every cache key, at most one computation is in flight
//! at any time, whether it runs in-process or on the [`TaskPool`]. Callers arriving while a
//! computation runs join it through the placeholder stored in the [`CacheStore`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::caching::{
    CacheError, CacheScope, CacheStore, CacheValue, Identity, PendingTask, RegistryEntry,
    TaskError, WaitError,
};
use crate::pool::{PoolError, TaskPool, Value};

/// An error returned when submitting a computation to the pool.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

type LockKey = (String, CacheScope, String);

/// Async locks per cache key, created on demand and removed once nobody uses them.
#[derive(Debug, Default)]
struct KeyLocks(Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>);

impl KeyLocks {
    fn key(entry: &RegistryEntry, identity: &Identity, key: &str) -> Result<LockKey, CacheError> {
        Ok((entry.uid().to_owned(), entry.scope(identity)?, key.to_owned()))
    }

    async fn lock(self: &Arc<Self>, key: LockKey) -> KeyLock {
        let lock = Arc::clone(self.0.lock().unwrap().entry(key.clone()).or_default());
        let guard = lock.lock_owned().await;
        KeyLock {
            locks: Arc::clone(self),
            key,
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Holds the lock of one cache key, removing it from the map once nobody else uses it.
struct KeyLock {
    locks: Arc<KeyLocks>,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.0.lock().unwrap();
        let unused = locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if unused {
            locks.remove(&self.key);
        }
    }
}

/// Whether a placeholder failed, in which case it is replaced by a fresh computation.
fn is_failed(value: &CacheValue<Value>) -> bool {
    match value {
        CacheValue::Ready(_) => false,
        CacheValue::Pending(pending) => matches!(pending.try_get(), Some(Err(_))),
        CacheValue::Task(task) => matches!(task.try_get(), Some(Err(_))),
    }
}

/// Deletes `placeholder` from the store, unless it was replaced in the meantime.
///
/// Placeholders are pinned, nothing but this removes the placeholder of a failed computation.
fn discard_placeholder(
    store: &CacheStore<Value>,
    entry: &RegistryEntry,
    identity: &Identity,
    key: &str,
    placeholder: &CacheValue<Value>,
) -> Result<bool, CacheError> {
    let current = store.get(entry, identity, key, false, false)?;
    if current.as_ref() != Some(placeholder) {
        return Ok(false);
    }
    store.delete(entry, identity, key)?;
    Ok(true)
}

/// Deduplicates computations of cached values.
#[derive(Debug)]
pub struct Coordinator {
    store: Arc<CacheStore<Value>>,
    locks: Arc<KeyLocks>,
}

impl Coordinator {
    pub fn new(store: Arc<CacheStore<Value>>) -> Self {
        Self {
            store,
            locks: Default::default(),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<Value>> {
        &self.store
    }

    /// The number of cache keys currently locked or waited on.
    pub fn locked_keys(&self) -> usize {
        self.locks.len()
    }

    async fn lock(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
    ) -> Result<KeyLock, CacheError> {
        Ok(self.locks.lock(KeyLocks::key(entry, identity, key)?).await)
    }

    /// Returns the cached value for `key`, computing it with `compute` if it is missing.
    ///
    /// Concurrent callers for the same key wait for the first caller's computation instead of
    /// running `compute` themselves. The placeholder they wait on is pinned until the computation
    /// finishes. If the computation fails, its placeholder is removed so the next caller tries
    /// again.
    pub async fn get_or_compute<F, Fut>(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
        compute: F,
    ) -> Result<Value, WaitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let pending = {
            let _lock = self.lock(entry, identity, key).await?;
            match self.store.get(entry, identity, key, false, false)? {
                Some(existing) if !is_failed(&existing) => {
                    drop(_lock);
                    return Ok(existing.resolve().await?);
                }
                _ => self.store.set_pending_value(entry, identity, key)?,
            }
        };

        // An abandoned computation gives up its placeholder. The placeholder is removed before it
        // fails, while callers holding the key lock still join instead of replacing it.
        let guard = crate::utils::defer::defer(|| {
            if pending.is_resolved() {
                return;
            }
            let placeholder = CacheValue::Pending(pending.clone());
            if let Err(err) = discard_placeholder(&self.store, entry, identity, key, &placeholder)
            {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to remove abandoned placeholder"
                );
            }
            pending.fail(TaskError::Cancelled);
        });
        let result = compute().await;
        guard.disarm();

        match result {
            Ok(value) => {
                let stored = self.store.fulfill(entry, identity, key, value.clone());
                if !pending.is_resolved() {
                    pending.resolve(value.clone());
                }
                stored?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(uid = entry.uid(), key, "computation failed: {err:#}");
                let error = TaskError::computation(&err);
                pending.fail(error.clone());

                let _lock = self.lock(entry, identity, key).await?;
                let placeholder = CacheValue::Pending(pending.clone());
                discard_placeholder(&self.store, entry, identity, key, &placeholder)?;
                Err(error.into())
            }
        }
    }

    /// Returns a task computing the value for `key` on the pool.
    ///
    /// If a task for the key is already in flight, the caller subscribes to it instead of
    /// submitting another one. Ready values are returned as an already resolved task. Once the
    /// task completes, its value is written back to the store, releasing the pinned placeholder.
    /// Cancelling the task through all of its subscribers cancels it on the pool.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_or_submit(
        &self,
        entry: &RegistryEntry,
        identity: &Identity,
        key: &str,
        pool: &TaskPool,
        function_name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<PendingTask<Value>, SubmitError> {
        let lock_key = KeyLocks::key(entry, identity, key)?;
        let _lock = self.locks.lock(lock_key.clone()).await;
        match self.store.get(entry, identity, key, false, false)? {
            Some(existing) if is_failed(&existing) => {}
            Some(CacheValue::Ready(value)) => {
                let task = PendingTask::new(Uuid::new_v4().to_string());
                task.resolve(value);
                return Ok(task);
            }
            Some(CacheValue::Task(task)) => {
                task.add_subscriber();
                tracing::trace!(task_id = task.task_id(), key, "joining in-flight task");
                return Ok(task);
            }
            Some(CacheValue::Pending(pending)) => {
                let task = PendingTask::new(Uuid::new_v4().to_string());
                let follower = task.clone();
                tokio::spawn(async move {
                    match pending.wait().await {
                        Ok(value) => follower.resolve(value),
                        Err(error) => follower.fail(error),
                    };
                });
                return Ok(task);
            }
            None => {}
        }

        let task_id = Uuid::new_v4().to_string();
        let handle = pool.submit(&task_id, function_name, args, kwargs)?;
        let task = self
            .store
            .set_pending_task(entry, identity, key, &task_id)?;

        let cancel_pool = pool.clone();
        let cancel_id = task_id.clone();
        task.set_cancel_hook(Box::new(move || {
            let pool = cancel_pool.clone();
            let task_id = cancel_id.clone();
            Box::pin(async move {
                if let Err(err) = pool.cancel(&task_id).await {
                    tracing::error!(
                        %task_id,
                        error = &err as &dyn std::error::Error,
                        "failed to cancel pool task"
                    );
                }
            })
        }));

        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        let entry = entry.clone();
        let identity = identity.clone();
        let key = key.to_owned();
        let completed = task.clone();
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(value) => {
                    let stored = store.fulfill(&entry, &identity, &key, value.clone());
                    if let Err(err) = stored {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "failed to store task result"
                        );
                    }
                    if !completed.is_resolved() {
                        completed.resolve(value);
                    }
                }
                Err(error) => {
                    if !completed.is_resolved() {
                        completed.fail(error);
                    }
                    let _lock = locks.lock(lock_key).await;
                    let placeholder = CacheValue::Task(completed.clone());
                    if let Err(err) =
                        discard_placeholder(&store, &entry, &identity, &key, &placeholder)
                    {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "failed to remove failed task"
                        );
                    }
                }
            }
        });

        Ok(task)
    }
}
