use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use super::Value;
use super::shm::ShmPointer;
use crate::caching::{PendingValue, TaskError};

/// The lifecycle of a [`TaskPool`](super::TaskPool).
///
/// `Created -> Running -> Closed -> Stopped`, or `Error` if the pool failed to start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolStatus {
    Created,
    /// Accepting and running tasks.
    Running,
    /// Running the remaining tasks, but not accepting new ones.
    Closed,
    Stopped,
    Error,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolStatus::Created => "created",
            PoolStatus::Running => "running",
            PoolStatus::Closed => "closed",
            PoolStatus::Stopped => "stopped",
            PoolStatus::Error => "in error state",
        })
    }
}

/// The state of a worker process as seen by the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Spawned, but not initialized yet.
    Created,
    Idle,
    Working,
    /// Exited, or being terminated.
    Dead,
    /// Working on a task that no longer exists.
    Orphaned,
}

/// The number of workers the pool aims for with `running_tasks` live tasks.
///
/// This keeps one spare worker beyond the current demand, bounded by `max_workers`.
pub fn desired_workers(running_tasks: usize, max_workers: usize) -> usize {
    running_tasks.saturating_add(1).min(max_workers)
}

/// Called with the progress updates of a task.
pub type ProgressHandler = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// A progress update reported by a task function.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: String,
    /// The progress, usually between 0 and 100.
    pub progress: f64,
    pub message: String,
}

/// A task known to the pool, from submission until it is resolved.
#[derive(Debug)]
pub(crate) struct TaskDefinition {
    pub uid: String,
    pub function_name: String,
    /// The encoded [`TaskPayload`](super::messages::TaskPayload).
    pub payload: ShmPointer,
    /// The worker the task was dispatched to.
    pub worker_id: Option<u32>,
    pub submitted_at: Instant,
    /// When the worker acknowledged the task.
    pub started_at: Option<Instant>,
    pub result: PendingValue<Value>,
}

/// A handle to the result of a submitted task.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    task_id: String,
    result: PendingValue<Value>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: String, result: PendingValue<Value>) -> Self {
        Self { task_id, result }
    }

    pub(crate) fn failed(task_id: String, error: TaskError) -> Self {
        let result = PendingValue::new();
        result.fail(error);
        Self::new(task_id, result)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Waits for the task to complete.
    pub async fn wait(&self) -> Result<Value, TaskError> {
        self.result.wait().await
    }

    pub fn try_get(&self) -> Option<Result<Value, TaskError>> {
        self.result.try_get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_workers() {
        assert_eq!(desired_workers(0, 4), 1);
        assert_eq!(desired_workers(2, 4), 3);
        assert_eq!(desired_workers(3, 4), 4);
        assert_eq!(desired_workers(10, 4), 4);
        assert_eq!(desired_workers(0, 1), 1);
        assert_eq!(desired_workers(5, 1), 1);

        for running in 0..20 {
            for max in 1..8 {
                assert!(desired_workers(running, max) <= max);
            }
        }
    }
}
