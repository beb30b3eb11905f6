use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::channel;
use super::definitions::WorkerStatus;
use super::error::PoolError;
use super::messages::{WorkerCommand, WorkerMessage};
use crate::config::PoolConfig;

pub const ENV_TASK_MODULE: &str = "DARA_TASK_MODULE";
pub const ENV_SHM_DIR: &str = "DARA_SHM_DIR";
pub const ENV_MAX_PAYLOAD_SIZE: &str = "DARA_MAX_PAYLOAD_SIZE";

#[derive(Debug)]
pub(crate) struct WorkerState {
    pub status: WorkerStatus,
    /// The task the worker was dispatched, until it reports back.
    pub task_id: Option<String>,
    pub idle_since: Instant,
}

impl WorkerState {
    /// Whether the worker can take a task.
    pub fn is_free(&self) -> bool {
        self.status == WorkerStatus::Idle && self.task_id.is_none()
    }

    pub fn set_idle(&mut self) {
        self.status = WorkerStatus::Idle;
        self.task_id = None;
        self.idle_since = Instant::now();
    }
}

/// A worker process spawned by the pool.
///
/// The worker reads [`WorkerCommand`]s from its `stdin` and writes [`WorkerMessage`]s to its
/// `stdout`, which are forwarded into the pool's message channel. Its `stderr` is inherited.
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    pid: u32,
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pub state: Mutex<WorkerState>,
}

impl WorkerProcess {
    pub fn spawn(
        executable: &Path,
        config: &PoolConfig,
        messages: mpsc::UnboundedSender<(u32, WorkerMessage)>,
    ) -> Result<Self, PoolError> {
        let mut child = Command::new(executable)
            .env(ENV_TASK_MODULE, &config.task_module)
            .env(ENV_SHM_DIR, &config.shm_dir)
            .env(ENV_MAX_PAYLOAD_SIZE, config.max_payload_size.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(PoolError::Spawn)?;

        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(channel::forward_messages(pid, stdout, messages));
        }

        tracing::debug!(pid, "spawned worker process");
        Ok(Self {
            pid,
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Created,
                task_id: None,
                idle_since: Instant::now(),
            }),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().unwrap().status
    }

    pub async fn send(&self, command: &WorkerCommand) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        match stdin.as_mut() {
            Some(stdin) => channel::send_command(stdin, command).await,
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Checks whether the process exited, without waiting.
    ///
    /// Returns `None` while the process runs, or while it is being terminated.
    pub fn try_exit_status(&self) -> Option<Result<ExitStatus, std::io::Error>> {
        let mut child = self.child.try_lock().ok()?;
        child.try_wait().transpose()
    }

    /// Stops the process, escalating until it is gone.
    ///
    /// The worker first gets a chance to exit on its own by closing its command pipe, which stops
    /// idle workers. Next it receives a `SIGTERM`, which stops workers busy with a task. If it is
    /// still alive after `timeout`, it is killed.
    pub async fn terminate(&self, timeout: Duration) -> Result<(), PoolError> {
        self.state.lock().unwrap().status = WorkerStatus::Dead;
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }

        if let Some(pid) = child.id() {
            // SAFETY: `kill` has no memory safety preconditions. The pid belongs to our child,
            // which has not been reaped yet.
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }
        if tokio::time::timeout(timeout, child.wait()).await.is_ok() {
            tracing::trace!(pid = self.pid, "worker process terminated");
            return Ok(());
        }

        tracing::debug!(pid = self.pid, "worker did not terminate, killing it");
        let _ = child.start_kill();
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(PoolError::Unkillable { pid: self.pid }),
        }
    }
}
