//! # Task pool
//!
//! The [`TaskPool`] runs expensive task functions in a pool of persistent worker processes, so
//! they neither block the server nor compete with it for a single core.
//!
//! ## Lifecycle
//!
//! A pool is [`start`](TaskPool::start)ed once, which spawns a supervisor task and waits for the
//! initial workers. Afterwards tasks are [`submit`](TaskPool::submit)ted and resolve through
//! their [`TaskHandle`]. [`close`](TaskPool::close) stops accepting tasks,
//! [`join`](TaskPool::join) additionally waits for the remaining ones, and
//! [`stop`](TaskPool::stop) terminates all workers right away.
//!
//! ## Supervision
//!
//! The supervisor keeps `min(live_tasks + 1, max_workers)` workers, see [`desired_workers`].
//! Every 100ms, or whenever something happens, it:
//!
//! - stops excess workers that were idle for longer than `worker_timeout`,
//! - stops workers busy with a task that was cancelled,
//! - reaps workers that died, failing their task with [`TaskError::WorkerFailure`],
//! - spawns workers up to the desired number,
//! - hands queued tasks to idle workers in submission order,
//! - and handles one message from the workers.
//!
//! ## Transport
//!
//! Workers are separate processes running [`worker::run_worker`]. Commands and messages are
//! newline-delimited JSON on the worker's `stdin` and `stdout`, see [`messages`]. Task payloads
//! and results travel through shared memory, see [`shm`].
//!
//! ## Metrics
//!
//! - `pool.tasks.submitted`: Tasks accepted by the pool.
//! - `pool.tasks.duration`: Time from submission to completion, tagged with the outcome.
//! - `pool.workers.spawned`: Worker processes started.
//! - `pool.workers.dead`: Worker processes that died unexpectedly.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::caching::{PendingValue, TaskError};
use crate::config::PoolConfig;
use crate::utils::futures::wait_while;

mod channel;
mod definitions;
mod error;
pub mod messages;
mod process;
pub mod shm;
mod value;
pub mod worker;

pub use definitions::{
    PoolStatus, ProgressHandler, ProgressUpdate, TaskHandle, WorkerStatus, desired_workers,
};
pub use error::PoolError;
pub use value::Value;

use definitions::TaskDefinition;
use messages::{TaskPayload, WorkerCommand, WorkerMessage};
use process::WorkerProcess;
use shm::SharedMemory;

/// The cadence of the supervisor loop.
const SUPERVISOR_INTERVAL: Duration = Duration::from_millis(100);

type MessageReceiver = mpsc::UnboundedReceiver<(u32, WorkerMessage)>;

struct PoolState {
    status: PoolStatus,
    /// All live tasks, queued or running.
    tasks: HashMap<String, TaskDefinition>,
    /// Tasks waiting for a worker, in submission order.
    queue: VecDeque<String>,
    progress_handlers: HashMap<String, ProgressHandler>,
}

impl std::fmt::Debug for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolState")
            .field("status", &self.status)
            .field("tasks", &self.tasks)
            .field("queue", &self.queue)
            .field("progress_handlers", &self.progress_handlers.len())
            .finish()
    }
}

struct PoolInner {
    config: PoolConfig,
    executable: PathBuf,
    shm: SharedMemory,
    state: Mutex<PoolState>,
    workers: Mutex<HashMap<u32, Arc<WorkerProcess>>>,
    wakeup: Notify,
    messages_tx: mpsc::UnboundedSender<(u32, WorkerMessage)>,
    messages_rx: Mutex<Option<MessageReceiver>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A pool of worker processes running task functions.
///
/// The pool is cheap to clone, all clones refer to the same workers.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("status", &self.status())
            .field("workers", &self.inner.workers.lock().unwrap().len())
            .finish()
    }
}

impl TaskPool {
    pub fn new(config: PoolConfig) -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let executable = config.worker_executable();
        let shm = SharedMemory::new(&config.shm_dir, config.max_payload_size);
        Self {
            inner: Arc::new(PoolInner {
                config,
                executable,
                shm,
                state: Mutex::new(PoolState {
                    status: PoolStatus::Created,
                    tasks: HashMap::new(),
                    queue: VecDeque::new(),
                    progress_handlers: HashMap::new(),
                }),
                workers: Default::default(),
                wakeup: Notify::new(),
                messages_tx,
                messages_rx: Mutex::new(Some(messages_rx)),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// The number of live worker processes.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().unwrap().len()
    }

    /// The number of submitted tasks that have not completed yet.
    pub fn running_tasks(&self) -> usize {
        self.inner.state.lock().unwrap().tasks.len()
    }

    /// Starts the supervisor and waits until the initial workers are idle.
    ///
    /// If they are not ready within the configured `startup_timeout`, the pool moves to
    /// [`PoolStatus::Error`] and its workers are terminated.
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.status != PoolStatus::Created {
                return Err(PoolError::NotRunning(state.status));
            }
            state.status = PoolStatus::Running;
        }

        let Some(messages) = self.inner.messages_rx.lock().unwrap().take() else {
            return Err(PoolError::NotRunning(PoolStatus::Error));
        };
        let supervisor = tokio::spawn(supervise(Arc::downgrade(&self.inner), messages));
        *self.inner.supervisor.lock().unwrap() = Some(supervisor);

        let timeout = self.inner.config.startup_timeout;
        if wait_while(|| !self.inner.is_ready(), timeout).await {
            tracing::info!(
                workers = self.worker_count(),
                max_workers = self.inner.config.max_workers.get(),
                "task pool started"
            );
            return Ok(());
        }

        tracing::error!(?timeout, "task pool failed to start");
        self.inner.set_status(PoolStatus::Error);
        self.shutdown().await?;
        Err(PoolError::StartupTimeout(timeout))
    }

    /// Stops accepting new tasks. Submitted tasks still run to completion.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.status == PoolStatus::Running {
            state.status = PoolStatus::Closed;
        }
    }

    /// Terminates all workers, failing unfinished tasks with [`TaskError::PoolStopped`].
    pub async fn stop(&self) -> Result<(), PoolError> {
        self.inner.set_status(PoolStatus::Stopped);
        self.shutdown().await
    }

    /// Closes the pool, waits up to `timeout` for the remaining tasks, then stops it.
    ///
    /// Without a timeout, this waits for as long as tasks remain.
    pub async fn join(&self, timeout: Option<Duration>) -> Result<(), PoolError> {
        self.close();
        let timeout = timeout.unwrap_or(Duration::MAX);
        if !wait_while(|| self.running_tasks() > 0, timeout).await {
            tracing::warn!(
                remaining = self.running_tasks(),
                "tasks did not complete in time, stopping pool"
            );
        }
        self.stop().await
    }

    async fn shutdown(&self) -> Result<(), PoolError> {
        self.inner.wakeup.notify_one();
        let supervisor = self.inner.supervisor.lock().unwrap().take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "task pool supervisor failed"
                );
            }
        }

        let workers: Vec<_> = self.inner.workers.lock().unwrap().drain().collect();
        let timeout = self.inner.config.terminate_timeout;
        let results = futures::future::join_all(
            workers
                .iter()
                .map(|(_, worker)| worker.terminate(timeout)),
        )
        .await;

        let leftovers: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.clear();
            state.progress_handlers.clear();
            state.tasks.drain().map(|(_, task)| task).collect()
        };
        for task in leftovers {
            self.inner.shm.release(&task.payload);
            task.result.fail(TaskError::PoolStopped);
        }

        tracing::info!(workers = workers.len(), "task pool stopped");
        results.into_iter().collect()
    }

    /// Submits a task, returning a handle to its result.
    ///
    /// If the arguments cannot be encoded, the handle is resolved with
    /// [`TaskError::Pickling`] right away.
    pub fn submit(
        &self,
        task_uid: &str,
        function_name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<TaskHandle, PoolError> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.status != PoolStatus::Running {
                return Err(PoolError::NotRunning(state.status));
            }
            if state.tasks.contains_key(task_uid) {
                return Err(PoolError::DuplicateTask(task_uid.to_owned()));
            }
        }

        let payload = TaskPayload {
            function_name: function_name.to_owned(),
            args,
            kwargs,
        };
        let payload = match self.inner.shm.write(&payload) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(task_id = task_uid, %error, "failed to encode task payload");
                return Ok(TaskHandle::failed(task_uid.to_owned(), error));
            }
        };

        let result = PendingValue::new();
        let task = TaskDefinition {
            uid: task_uid.to_owned(),
            function_name: function_name.to_owned(),
            payload,
            worker_id: None,
            submitted_at: Instant::now(),
            started_at: None,
            result: result.clone(),
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            // the pool may have been stopped while encoding
            if state.status != PoolStatus::Running {
                self.inner.shm.release(&task.payload);
                return Err(PoolError::NotRunning(state.status));
            }
            state.tasks.insert(task_uid.to_owned(), task);
            state.queue.push_back(task_uid.to_owned());
        }

        metric!(counter("pool.tasks.submitted") += 1, "function" => function_name);
        tracing::debug!(task_id = task_uid, function = function_name, "submitted task");
        self.inner.wakeup.notify_one();
        Ok(TaskHandle::new(task_uid.to_owned(), result))
    }

    /// Cancels a task, resolving it with [`TaskError::Cancelled`].
    ///
    /// A worker already busy with the task is terminated, and replaced by the supervisor if
    /// needed. Returns `false` if the task was not live.
    pub async fn cancel(&self, task_uid: &str) -> Result<bool, PoolError> {
        let task = {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.retain(|id| id != task_uid);
            state.progress_handlers.remove(task_uid);
            state.tasks.remove(task_uid)
        };
        let Some(task) = task else {
            return Ok(false);
        };

        task.result.fail(TaskError::Cancelled);
        self.inner.shm.release(&task.payload);
        tracing::debug!(task_id = task_uid, "cancelled task");

        let worker = task
            .worker_id
            .and_then(|pid| self.inner.workers.lock().unwrap().remove(&pid));
        if let Some(worker) = worker {
            tracing::debug!(task_id = task_uid, pid = worker.pid(), "terminating busy worker");
            worker.terminate(self.inner.config.terminate_timeout).await?;
            self.inner.wakeup.notify_one();
        }
        Ok(true)
    }

    /// Registers a handler receiving the progress updates of a task.
    pub fn on_progress(&self, task_uid: &str, handler: ProgressHandler) {
        self.inner
            .state
            .lock()
            .unwrap()
            .progress_handlers
            .insert(task_uid.to_owned(), handler);
    }
}

impl PoolInner {
    fn status(&self) -> PoolStatus {
        self.state.lock().unwrap().status
    }

    fn set_status(&self, status: PoolStatus) {
        self.state.lock().unwrap().status = status;
        self.wakeup.notify_one();
    }

    fn desired_workers(&self) -> usize {
        let live_tasks = self.state.lock().unwrap().tasks.len();
        desired_workers(live_tasks, self.config.max_workers.get())
    }

    /// Whether the pool is running with all desired workers idle.
    fn is_ready(&self) -> bool {
        if self.status() != PoolStatus::Running {
            return false;
        }
        let desired = self.desired_workers();
        let workers = self.workers.lock().unwrap();
        let idle = workers
            .values()
            .filter(|worker| worker.status() == WorkerStatus::Idle)
            .count();
        idle >= desired
    }

    fn terminate_in_background(&self, worker: Arc<WorkerProcess>) {
        let timeout = self.config.terminate_timeout;
        tokio::spawn(async move {
            if let Err(err) = worker.terminate(timeout).await {
                tracing::error!(error = &err as &dyn std::error::Error, "failed to stop worker");
            }
        });
    }

    /// Stops idle workers beyond the desired number once they exceed the idle timeout.
    fn trim_idle_workers(&self) {
        let desired = self.desired_workers();
        let mut workers = self.workers.lock().unwrap();
        let mut excess = workers.len().saturating_sub(desired);
        if excess == 0 {
            return;
        }

        let expired: Vec<u32> = workers
            .values()
            .filter(|worker| {
                let state = worker.state.lock().unwrap();
                state.is_free() && state.idle_since.elapsed() > self.config.worker_timeout
            })
            .map(|worker| worker.pid())
            .collect();

        for pid in expired {
            if excess == 0 {
                break;
            }
            if let Some(worker) = workers.remove(&pid) {
                tracing::debug!(pid, "stopping excess idle worker");
                self.terminate_in_background(worker);
                excess -= 1;
            }
        }
    }

    /// Stops workers busy with tasks that no longer exist.
    fn kill_orphans(&self) {
        let orphans: Vec<Arc<WorkerProcess>> = {
            let state = self.state.lock().unwrap();
            let mut workers = self.workers.lock().unwrap();
            let pids: Vec<u32> = workers
                .values()
                .filter(|worker| {
                    let mut worker_state = worker.state.lock().unwrap();
                    let orphaned = worker_state
                        .task_id
                        .as_ref()
                        .is_some_and(|task_id| !state.tasks.contains_key(task_id));
                    if orphaned {
                        worker_state.status = WorkerStatus::Orphaned;
                    }
                    orphaned
                })
                .map(|worker| worker.pid())
                .collect();
            pids.iter().filter_map(|pid| workers.remove(pid)).collect()
        };

        for worker in orphans {
            tracing::debug!(pid = worker.pid(), "stopping orphaned worker");
            self.terminate_in_background(worker);
        }
    }

    /// Removes workers whose process exited, failing the task they were working on.
    fn reap_dead_workers(&self) {
        let dead: Vec<(Arc<WorkerProcess>, String)> = {
            let mut workers = self.workers.lock().unwrap();
            let mut dead = Vec::new();
            workers.retain(|pid, worker| match worker.try_exit_status() {
                None => true,
                Some(exit_status) => {
                    let exit_status = match exit_status {
                        Ok(status) => status.to_string(),
                        Err(err) => err.to_string(),
                    };
                    tracing::trace!(pid, %exit_status, "worker process exited");
                    dead.push((Arc::clone(worker), exit_status));
                    false
                }
            });
            dead
        };

        for (worker, exit_status) in dead {
            metric!(counter("pool.workers.dead") += 1);
            let task_id = {
                let mut worker_state = worker.state.lock().unwrap();
                worker_state.status = WorkerStatus::Dead;
                worker_state.task_id.take()
            };

            let task = task_id.and_then(|task_id| {
                let mut state = self.state.lock().unwrap();
                state.progress_handlers.remove(&task_id);
                state.tasks.remove(&task_id)
            });
            match task {
                Some(task) => {
                    tracing::error!(
                        pid = worker.pid(),
                        task_id = %task.uid,
                        function = %task.function_name,
                        %exit_status,
                        "worker died while running a task"
                    );
                    self.shm.release(&task.payload);
                    record_duration(&task, TaskError::WorkerFailure.metrics_tag());
                    task.result.fail(TaskError::WorkerFailure);
                }
                None => tracing::warn!(pid = worker.pid(), %exit_status, "worker died"),
            }
        }
    }

    /// Spawns workers up to the desired number.
    fn spawn_workers(&self) {
        let desired = self.desired_workers();
        let mut workers = self.workers.lock().unwrap();
        while workers.len() < desired {
            match WorkerProcess::spawn(&self.executable, &self.config, self.messages_tx.clone()) {
                Ok(worker) => {
                    metric!(counter("pool.workers.spawned") += 1);
                    workers.insert(worker.pid(), Arc::new(worker));
                }
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        executable = %self.executable.display(),
                        "failed to spawn worker"
                    );
                    break;
                }
            }
        }
    }

    /// Hands queued tasks to free workers.
    async fn dispatch(&self) {
        let assignments: Vec<(Arc<WorkerProcess>, WorkerCommand)> = {
            let mut state = self.state.lock().unwrap();
            let workers = self.workers.lock().unwrap();
            let mut free = workers
                .values()
                .filter(|worker| worker.state.lock().unwrap().is_free());

            let mut assignments = Vec::new();
            while !state.queue.is_empty() {
                let Some(worker) = free.next() else { break };
                let Some(task_id) = state.queue.pop_front() else {
                    break;
                };
                let Some(task) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                task.worker_id = Some(worker.pid());
                worker.state.lock().unwrap().task_id = Some(task_id.clone());
                let command = WorkerCommand::Task {
                    task_id,
                    payload: task.payload.clone(),
                };
                assignments.push((Arc::clone(worker), command));
            }
            assignments
        };

        for (worker, command) in assignments {
            if let Err(err) = worker.send(&command).await {
                // the worker is gone, the reaper fails the task
                tracing::warn!(
                    pid = worker.pid(),
                    error = &err as &dyn std::error::Error,
                    "failed to dispatch task"
                );
            }
        }
    }

    fn handle_message(&self, pid: u32, message: WorkerMessage) {
        let worker = self.workers.lock().unwrap().get(&pid).cloned();
        match message {
            WorkerMessage::Initialization => {
                if let Some(worker) = worker {
                    tracing::debug!(pid, "worker initialized");
                    worker.state.lock().unwrap().set_idle();
                }
            }
            WorkerMessage::Acknowledgement { task_id } => {
                if let Some(worker) = worker {
                    let mut worker_state = worker.state.lock().unwrap();
                    worker_state.status = WorkerStatus::Working;
                    worker_state.task_id = Some(task_id.clone());
                }
                let mut state = self.state.lock().unwrap();
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.worker_id = Some(pid);
                    task.started_at = Some(Instant::now());
                }
            }
            WorkerMessage::Result { task_id, result } => {
                if let Some(worker) = worker {
                    worker.state.lock().unwrap().set_idle();
                }
                let Some(task) = self.take_task(&task_id) else {
                    self.shm.release(&result);
                    return;
                };
                match self.shm.read::<Value>(&result) {
                    Ok(value) => {
                        tracing::debug!(%task_id, "task completed");
                        record_duration(&task, "ok");
                        task.result.resolve(value);
                    }
                    Err(error) => {
                        tracing::error!(%task_id, %error, "failed to decode task result");
                        record_duration(&task, error.metrics_tag());
                        task.result.fail(error);
                    }
                }
            }
            WorkerMessage::Problem {
                task_id: Some(task_id),
                error,
            } => {
                if let Some(worker) = worker {
                    worker.state.lock().unwrap().set_idle();
                }
                log_problem(pid, Some(&task_id), &error);
                if let Some(task) = self.take_task(&task_id) {
                    record_duration(&task, error.metrics_tag());
                    task.result.fail(error);
                }
            }
            WorkerMessage::Problem {
                task_id: None,
                error,
            } => log_problem(pid, None, &error),
            WorkerMessage::Log { task_id, message } => {
                tracing::info!(
                    target: "dara::worker",
                    pid,
                    task_id = task_id.as_deref(),
                    "{message}"
                );
            }
            WorkerMessage::Progress {
                task_id,
                progress,
                message,
            } => {
                let handler = self
                    .state
                    .lock()
                    .unwrap()
                    .progress_handlers
                    .get(&task_id)
                    .cloned();
                if let Some(handler) = handler {
                    handler(ProgressUpdate {
                        task_id,
                        progress,
                        message,
                    });
                }
            }
        }
    }

    fn take_task(&self, task_id: &str) -> Option<TaskDefinition> {
        let mut state = self.state.lock().unwrap();
        state.progress_handlers.remove(task_id);
        state.tasks.remove(task_id)
    }
}

fn log_problem(pid: u32, task_id: Option<&str>, error: &TaskError) {
    match error {
        TaskError::Remote(remote) => tracing::error!(
            pid,
            task_id,
            traceback = remote.traceback.as_deref(),
            "task failed: {remote:#}"
        ),
        error => tracing::error!(pid, task_id, %error, "worker reported a problem"),
    }
}

fn record_duration(task: &TaskDefinition, outcome: &str) {
    metric!(
        timer("pool.tasks.duration") = task.submitted_at.elapsed(),
        "outcome" => outcome,
    );
}

/// Runs the supervisor until the pool is stopped, fails, or is dropped.
async fn supervise(inner: Weak<PoolInner>, mut messages: MessageReceiver) {
    loop {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if matches!(inner.status(), PoolStatus::Stopped | PoolStatus::Error) {
            break;
        }

        inner.trim_idle_workers();
        inner.kill_orphans();
        inner.reap_dead_workers();
        inner.spawn_workers();
        inner.dispatch().await;

        tokio::select! {
            Some((pid, message)) = messages.recv() => inner.handle_message(pid, message),
            _ = inner.wakeup.notified() => {}
            _ = tokio::time::sleep(SUPERVISOR_INTERVAL) => {}
        }
    }
    tracing::debug!("task pool supervisor exited");
}
