//! The eviction-policy specific key-value stores.
//!
//! Every store guards its state with a single mutex, each operation runs in exactly one critical
//! section, and stores never lock each other.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CacheError, CacheWeight, PolicyKind};

mod keep_all;
mod lru;
mod ttl;

pub use keep_all::KeepAllStore;
pub use lru::LruStore;
pub use ttl::TtlStore;

/// A single-scope store implementing one eviction policy.
///
/// Pinned values are exempt from eviction until they are unpinned by a `get` with `unpin` set.
pub trait PolicyStore<V>: Send + Sync + fmt::Debug {
    /// Looks up `key`.
    ///
    /// Returns `Ok(None)` on a miss, unless `raise_for_missing` is set in which case a miss is a
    /// [`CacheError::NotFound`].
    fn get(&self, key: &str, unpin: bool, raise_for_missing: bool) -> Result<Option<V>, CacheError>;

    /// Stores `value` under `key`, returning the value it replaced.
    ///
    /// Setting an existing key never clears its pin.
    fn set(&self, key: &str, value: V, pin: bool) -> Option<V>;

    /// Stores `value` under `key` unpinned, dropping the pin of the value it replaced.
    fn replace(&self, key: &str, value: V) -> Option<V> {
        self.set(key, value, false)
    }

    /// Removes `key`, returning its value.
    fn delete(&self, key: &str) -> Option<V>;

    /// Removes everything.
    fn clear(&self);

    /// The number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates the store implementing `kind`.
///
/// All sizes of values entering and leaving the store are accounted on `size`.
pub fn for_policy<V>(kind: PolicyKind, size: SizeTracker) -> Arc<dyn PolicyStore<V>>
where
    V: CacheWeight + Clone + Send + Sync + fmt::Debug + 'static,
{
    match kind {
        PolicyKind::KeepAll => Arc::new(KeepAllStore::new(size)),
        PolicyKind::Lru { max_size } => Arc::new(LruStore::new(max_size.get(), size)),
        PolicyKind::Ttl { ttl } => Arc::new(TtlStore::new(ttl, size)),
    }
}

/// A shared, approximate counter of cached bytes.
///
/// Stores update it within the same critical section as the values they account for.
#[derive(Clone, Debug, Default)]
pub struct SizeTracker(Arc<AtomicUsize>);

impl SizeTracker {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn add<V: CacheWeight>(&self, value: &V) {
        self.0.fetch_add(value.weight(), Ordering::Relaxed);
    }

    pub(crate) fn sub<V: CacheWeight>(&self, value: &V) {
        let weight = value.weight();
        // The weight of a value may not be stable over its lifetime, never underflow.
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(weight))
            });
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

fn not_found(key: &str) -> CacheError {
    CacheError::NotFound(key.to_owned())
}
