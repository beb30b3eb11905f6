//! Helpers for tests of the service and of crates building on it.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

pub use dara_test::{TempDir, setup, tempdir};

use crate::caching::{CachePolicy, CacheStore, CacheWeight, RegistryEntry};
use crate::metrics::MetricsSink;

/// A [`MetricsSink`] remembering every published size.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sizes: Mutex<Vec<usize>>,
}

impl RecordingSink {
    /// All published sizes, oldest first.
    pub fn sizes(&self) -> Vec<usize> {
        self.sizes.lock().unwrap().clone()
    }

    /// The most recently published size.
    pub fn last(&self) -> Option<usize> {
        self.sizes.lock().unwrap().last().copied()
    }
}

impl MetricsSink for RecordingSink {
    fn update_store(&self, total_bytes: usize) {
        self.sizes.lock().unwrap().push(total_bytes);
    }
}

/// Creates a store publishing into a fresh [`RecordingSink`].
pub fn recording_store<T>() -> (CacheStore<T>, Arc<RecordingSink>)
where
    T: CacheWeight + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    let sink = Arc::new(RecordingSink::default());
    (CacheStore::new(sink.clone()), sink)
}

/// A registry entry with an LRU policy of the given size.
///
/// # Panics
///
/// Panics if `max_size` is zero.
pub fn lru_entry(uid: &str, max_size: usize) -> RegistryEntry {
    let max_size = NonZeroUsize::new(max_size).expect("LRU caches hold at least one value");
    RegistryEntry::cached(uid, CachePolicy::lru(max_size))
}
