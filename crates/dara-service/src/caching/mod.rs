//! # Dara caching infrastructure
//!
//! Derived variables and other registry entries cache the results of expensive computations.
//! This module contains the in-memory cache they share, and the placeholder values used to
//! deduplicate concurrent computations of the same key.
//!
//! ## Layout
//!
//! The cache is organized in three levels:
//!
//! - The [`CacheStore`] is shared by the whole application. It owns one [`ScopedCache`] per
//!   [`RegistryEntry`], keyed by the entry's uid.
//! - A [`ScopedCache`] partitions the values of one entry by [`CacheScope`]. The scope is derived
//!   from the [`CacheType`] of the entry's [`CachePolicy`] and the caller's [`Identity`], so a
//!   session cache keeps separate values for every session.
//! - Every scope is backed by one of the [`stores`], which implements the eviction policy:
//!   [`LruStore`](stores::LruStore), [`TtlStore`](stores::TtlStore) or
//!   [`KeepAllStore`](stores::KeepAllStore).
//!
//! Values can be pinned when they are set, which exempts them from eviction until they are read
//! once with `unpin` set. This guarantees that a freshly computed value survives until whoever
//! requested it had a chance to read it.
//!
//! ## Placeholders
//!
//! While a value is being computed, its key holds a placeholder instead: a [`PendingValue`] for
//! in-process computations and a [`PendingTask`] for work running on the
//! [`TaskPool`](crate::pool::TaskPool). Callers finding a placeholder wait for it instead of
//! starting a second computation. See [`Coordinator`](crate::coordination::Coordinator) for how
//! placeholders are inserted without races.
//!
//! ## Metrics
//!
//! The store tracks an approximate size of everything it holds, see [`CacheWeight`], and reports
//! it as the `caches.store.size` gauge after every mutation.

mod error;
mod pending;
mod policy;
mod scoped;
mod store;
pub mod stores;
mod weight;
#[cfg(test)]
mod tests;

pub use error::{CacheError, RemoteError, TaskError, WaitError};
pub use pending::{CancelHook, PendingTask, PendingValue};
pub use policy::{
    CachePolicy, CacheScope, CacheType, Identity, ParseCacheTypeError, PolicyKind, RegistryEntry,
};
pub use scoped::ScopedCache;
pub use store::{CacheStore, CacheValue};
pub use weight::CacheWeight;
