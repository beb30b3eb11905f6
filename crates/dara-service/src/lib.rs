//! Caching and task coordination for the Dara application server.
//!
//! The crate is made of three layers:
//!
//! - [`caching`]: a scope-aware key-value store with pluggable eviction policies, and the
//!   placeholder values used to deduplicate concurrent computations.
//! - [`pool`]: a supervisor for a pool of worker processes that run expensive task functions
//!   out of process, exchanging payloads through shared memory.
//! - [`coordination`]: the glue guaranteeing at most one in-flight computation per cache key,
//!   either in-process or on the pool.
//!
//! [`services::Services`] wires all of these up from a [`config::Config`].

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordination;
pub mod logging;
pub mod pool;
pub mod services;
pub mod utils;

#[cfg(any(feature = "test", test))]
#[allow(unused)]
pub mod test;
