//! The messages exchanged between the pool and its workers.
//!
//! Both directions use newline-delimited JSON. Payloads and results are not part of the messages,
//! they are passed through shared memory, see [`shm`](super::shm).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Value;
use super::shm::ShmPointer;
use crate::caching::TaskError;

/// The encoded content of a task, written to shared memory by the pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub function_name: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

/// A command sent from the pool to a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Run a task. The payload is a [`TaskPayload`].
    Task {
        task_id: String,
        payload: ShmPointer,
    },
}

/// A message sent from a worker to the pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker loaded its task module and is ready for tasks.
    Initialization,
    /// The worker started working on a task.
    Acknowledgement { task_id: String },
    /// A task completed. The result is a [`Value`].
    Result { task_id: String, result: ShmPointer },
    /// A task failed, or the worker hit a problem outside of any task.
    Problem {
        task_id: Option<String>,
        error: TaskError,
    },
    /// A line the task function printed to `stdout`.
    Log {
        task_id: Option<String>,
        message: String,
    },
    /// A progress update reported by a task function.
    Progress {
        task_id: String,
        progress: f64,
        message: String,
    },
}

impl WorkerMessage {
    /// The task this message is about, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            WorkerMessage::Initialization => None,
            WorkerMessage::Acknowledgement { task_id }
            | WorkerMessage::Result { task_id, .. }
            | WorkerMessage::Progress { task_id, .. } => Some(task_id),
            WorkerMessage::Problem { task_id, .. } | WorkerMessage::Log { task_id, .. } => {
                task_id.as_deref()
            }
        }
    }
}
