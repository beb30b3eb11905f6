use std::io;
use std::time::Duration;

use thiserror::Error;

use super::PoolStatus;

/// An error operating the [`TaskPool`](super::TaskPool) itself.
///
/// Failures of individual tasks are never reported through this type, they resolve the task's
/// handle with a [`TaskError`](crate::caching::TaskError) instead.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool is not in a state that allows the operation.
    #[error("task pool is {0}")]
    NotRunning(PoolStatus),
    /// Not all initial workers became idle in time.
    #[error("task pool did not start within {0:?}")]
    StartupTimeout(Duration),
    /// A task with the same uid is still live.
    #[error("task `{0}` was already submitted")]
    DuplicateTask(String),
    /// The worker executable could not be started.
    #[error("failed to spawn worker process")]
    Spawn(#[source] io::Error),
    /// A worker process survived being killed.
    #[error("worker process {pid} did not exit after being killed")]
    Unkillable { pid: u32 },
}
