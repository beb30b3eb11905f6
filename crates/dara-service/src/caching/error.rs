use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::CacheType;

/// An error raised by the cache store itself.
///
/// These are either lookups explicitly asking to fail on a miss, or programmer errors such as
/// storing a value for an entry without a cache policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The key is not present in the store, and the caller asked to fail on misses.
    #[error("cache key `{0}` not found")]
    NotFound(String),
    /// The registry entry has no cache policy attached.
    #[error("registry entry `{0}` has no cache policy")]
    MissingPolicy(String),
    /// The scope of a session or user cache could not be derived from the caller's identity.
    #[error("cannot resolve a {0} cache scope without a {0} identity")]
    MissingScope(CacheType),
}

/// The reason why a computation tracked by a [`PendingValue`](super::PendingValue) or
/// [`PendingTask`](super::PendingTask) did not produce a value.
///
/// This error is broadcast to every waiter, and it travels between worker processes and the
/// pool, hence it is `Clone` and serializable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "details", rename_all = "snake_case")]
pub enum TaskError {
    /// The task was cancelled by its last subscriber.
    #[error("task was cancelled")]
    Cancelled,
    /// The worker process running the task died unexpectedly.
    #[error("unexpected worker failure")]
    WorkerFailure,
    /// The pool was stopped before the task could complete.
    #[error("task pool was stopped")]
    PoolStopped,
    /// The task arguments or its result could not be (de)serialized.
    ///
    /// This is kept separate from [`Remote`](Self::Remote) so that transport problems are never
    /// mistaken for failures of the task code itself.
    #[error("failed to serialize task data: {0}")]
    Pickling(String),
    /// The configured task module does not expose the requested function.
    #[error("function `{0}` not found in task module")]
    UnknownFunction(String),
    /// The task code itself failed in the worker.
    #[error(transparent)]
    Remote(RemoteError),
    /// An in-process computation failed.
    #[error("computation failed: {0}")]
    Computation(String),
}

impl TaskError {
    /// Wraps a (de)serialization failure.
    pub fn pickling<E: fmt::Display>(err: E) -> Self {
        Self::Pickling(err.to_string())
    }

    /// Wraps an arbitrary in-process failure, keeping its full error chain in the message.
    pub fn computation(err: &anyhow::Error) -> Self {
        Self::Computation(format!("{err:#}"))
    }

    /// A short tag for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            TaskError::Cancelled => "cancelled",
            TaskError::WorkerFailure => "worker_failure",
            TaskError::PoolStopped => "pool_stopped",
            TaskError::Pickling(_) => "pickling",
            TaskError::UnknownFunction(_) => "unknown_function",
            TaskError::Remote(_) => "remote",
            TaskError::Computation(_) => "computation",
        }
    }
}

/// An error returned when waiting for a cached value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// The placeholder found in the cache resolved to an error.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// An error raised by task code inside a worker process.
///
/// Neither error sources nor backtraces can cross a process boundary, so the worker renders them
/// into strings which are attached to this error on the pool side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// The top-level error message.
    pub message: String,
    /// The messages of all the error's sources, outermost first.
    #[serde(default)]
    pub chain: Vec<String>,
    /// The backtrace captured in the worker, if any.
    #[serde(default)]
    pub traceback: Option<String>,
}

impl RemoteError {
    /// Renders an [`anyhow::Error`] including its source chain and backtrace.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let backtrace = err.backtrace();
        let traceback = match backtrace.status() {
            std::backtrace::BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };
        Self {
            message: err.to_string(),
            chain: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
            traceback,
        }
    }

    /// Creates an error for a panic inside task code.
    pub fn from_panic(message: String, traceback: Option<String>) -> Self {
        Self {
            message: format!("task panicked: {message}"),
            chain: vec![],
            traceback,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if f.alternate() {
            for cause in &self.chain {
                write!(f, ": {cause}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
