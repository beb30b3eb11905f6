//! The worker side of the pool.
//!
//! A worker executable registers its [`TaskModules`] and calls [`run_worker`]. The pool selects
//! the module through the environment, see [`ENV_TASK_MODULE`].
//!
//! While a task runs, everything it prints to `stdout` is forwarded to the pool as log messages
//! tagged with the task id. All of them are sent before the task's result. The protocol itself
//! uses a duplicate of the original `stdout` descriptor.

use std::backtrace::Backtrace;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::FromRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::runtime::Runtime;
use uuid::Uuid;

use super::Value;
use super::channel::{self, MessageSender};
use super::messages::{TaskPayload, WorkerCommand, WorkerMessage};
pub use super::process::{ENV_MAX_PAYLOAD_SIZE, ENV_SHM_DIR, ENV_TASK_MODULE};
use super::shm::{SharedMemory, ShmPointer};
use crate::caching::{RemoteError, TaskError};
use crate::config::PoolConfig;

type SyncFn = Box<dyn Fn(TaskCall) -> Result<Value> + Send + Sync>;
type AsyncFn = Box<dyn Fn(TaskCall) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A function exposed by a [`TaskModule`].
pub enum TaskFunction {
    Sync(SyncFn),
    /// Runs on a current-thread runtime owned by the worker.
    Async(AsyncFn),
}

impl TaskFunction {
    fn call(&self, call: TaskCall, runtime: &Runtime) -> Result<Value> {
        match self {
            TaskFunction::Sync(f) => f(call),
            TaskFunction::Async(f) => runtime.block_on(f(call)),
        }
    }
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFunction::Sync(_) => f.write_str("TaskFunction::Sync"),
            TaskFunction::Async(_) => f.write_str("TaskFunction::Async"),
        }
    }
}

/// A named set of task functions.
#[derive(Debug)]
pub struct TaskModule {
    name: String,
    functions: HashMap<String, TaskFunction>,
}

impl TaskModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a blocking function.
    pub fn with_sync<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(TaskCall) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions
            .insert(name.to_owned(), TaskFunction::Sync(Box::new(f)));
        self
    }

    /// Registers an async function.
    pub fn with_async<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let f: AsyncFn = Box::new(move |call| Box::pin(f(call)));
        self.functions
            .insert(name.to_owned(), TaskFunction::Async(f));
        self
    }

    pub fn function(&self, name: &str) -> Option<&TaskFunction> {
        self.functions.get(name)
    }
}

/// The task modules compiled into a worker executable.
#[derive(Debug, Default)]
pub struct TaskModules {
    modules: HashMap<String, TaskModule>,
}

impl TaskModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, module: TaskModule) -> Self {
        self.modules.insert(module.name.clone(), module);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TaskModule> {
        self.modules.get(name)
    }
}

/// Reports the progress of a running task to the pool.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    task_id: String,
    messages: Option<Arc<MessageSender>>,
}

impl ProgressReporter {
    pub fn report(&self, progress: f64, message: impl Into<String>) {
        let Some(messages) = &self.messages else {
            return;
        };
        let message = WorkerMessage::Progress {
            task_id: self.task_id.clone(),
            progress,
            message: message.into(),
        };
        if let Err(err) = messages.send(&message) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to report progress"
            );
        }
    }
}

/// The invocation of a task function.
#[derive(Debug)]
pub struct TaskCall {
    pub task_id: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    progress: ProgressReporter,
}

impl TaskCall {
    /// Creates a call that does not report progress anywhere.
    pub fn new(task_id: impl Into<String>, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        let task_id = task_id.into();
        Self {
            progress: ProgressReporter {
                task_id: task_id.clone(),
                messages: None,
            },
            task_id,
            args,
            kwargs,
        }
    }

    /// Returns the positional argument at `index`.
    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args
            .get(index)
            .with_context(|| format!("missing positional argument {index}"))
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn report_progress(&self, progress: f64, message: impl Into<String>) {
        self.progress.report(progress, message);
    }

    /// A reporter that can be moved into futures or threads.
    pub fn progress(&self) -> ProgressReporter {
        self.progress.clone()
    }
}

static PANIC_TRACEBACK: Mutex<Option<String>> = Mutex::new(None);

fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let traceback = format!("{info}\n{}", Backtrace::force_capture());
        tracing::debug!("task panicked: {info}");
        if let Ok(mut slot) = PANIC_TRACEBACK.lock() {
            *slot = Some(traceback);
        }
    }));
}

fn take_panic_traceback() -> Option<String> {
    PANIC_TRACEBACK.lock().ok()?.take()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Ignores `SIGTERM` while idle, so that only a closed command pipe stops an idle worker.
fn ignore_sigterm() {
    // SAFETY: installs a disposition, no handler code runs.
    unsafe { libc::signal(libc::SIGTERM, libc::SIG_IGN) };
}

/// Restores the default `SIGTERM` behavior while a task runs, so the pool can interrupt it.
fn default_sigterm() {
    // SAFETY: installs a disposition, no handler code runs.
    unsafe { libc::signal(libc::SIGTERM, libc::SIG_DFL) };
}

/// How long a finished task waits for its output to be forwarded.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The read end of the pipe that replaced `stdout`.
struct CapturedStdout {
    reader: Box<dyn io::Read + Send>,
    current_task: Arc<Mutex<Option<String>>>,
    fence: String,
    drained: mpsc::Sender<()>,
}

impl CapturedStdout {
    /// Forwards every captured line as a [`WorkerMessage::Log`] on a background thread.
    ///
    /// A line ending in the fence marker closes the output of the current task and is
    /// acknowledged to [`TaskOutput::finish`].
    fn forward(self, messages: Arc<MessageSender>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut reader = BufReader::new(self.reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let text = String::from_utf8_lossy(&buf);
                let line = text.strip_suffix('\n').unwrap_or(&*text);
                let (message, fenced) = match line.strip_suffix(self.fence.as_str()) {
                    Some(rest) => (rest, true),
                    None => (line, false),
                };

                // a fence may follow output without a trailing newline
                if !(fenced && message.is_empty()) {
                    let message = WorkerMessage::Log {
                        task_id: self.current_task.lock().unwrap().clone(),
                        message: message.to_owned(),
                    };
                    if messages.send(&message).is_err() {
                        break;
                    }
                }
                if fenced {
                    let _ = self.drained.send(());
                }
            }
        })
    }
}

/// Tags the captured output of the task that is currently running.
struct TaskOutput {
    current_task: Arc<Mutex<Option<String>>>,
    fence: String,
    drained: mpsc::Receiver<()>,
}

impl TaskOutput {
    fn begin(&self, task_id: &str) {
        *self.current_task.lock().unwrap() = Some(task_id.to_owned());
    }

    /// Waits until everything the task printed has been forwarded, then clears the task.
    fn finish(&self) {
        // acknowledgements of fences that timed out earlier
        while self.drained.try_recv().is_ok() {}

        let written = {
            let mut stdout = io::stdout().lock();
            stdout
                .flush()
                .and_then(|_| writeln!(stdout, "{}", self.fence))
                .and_then(|_| stdout.flush())
        };
        match written {
            Ok(()) => {
                if self.drained.recv_timeout(DRAIN_TIMEOUT).is_err() {
                    tracing::warn!("output of the task was not forwarded in time");
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to fence task output"
                );
            }
        }

        *self.current_task.lock().unwrap() = None;
    }
}

/// Moves `stdout` to a pipe and returns a duplicate of the original descriptor.
///
/// Everything written to the pipe is forwarded as [`WorkerMessage::Log`] messages once
/// [`CapturedStdout::forward`] is called.
fn redirect_stdout() -> io::Result<(File, CapturedStdout, TaskOutput)> {
    let mut fds = [0; 2];
    // SAFETY: all descriptors are checked, and ownership of each one is taken exactly once.
    let (protocol, reader) = unsafe {
        let protocol = libc::dup(libc::STDOUT_FILENO);
        if protocol < 0 {
            return Err(io::Error::last_os_error());
        }
        let protocol = File::from_raw_fd(protocol);
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let reader = File::from_raw_fd(fds[0]);
        let write_end = File::from_raw_fd(fds[1]);
        if libc::dup2(fds[1], libc::STDOUT_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
        drop(write_end);
        (protocol, reader)
    };

    let current_task = Arc::new(Mutex::new(None));
    let fence = format!("\u{0}dara-output-fence-{}", Uuid::new_v4());
    let (drained_tx, drained_rx) = mpsc::channel();
    let captured = CapturedStdout {
        reader: Box::new(reader),
        current_task: Arc::clone(&current_task),
        fence: fence.clone(),
        drained: drained_tx,
    };
    let output = TaskOutput {
        current_task,
        fence,
        drained: drained_rx,
    };
    Ok((protocol, captured, output))
}

struct Worker<'m> {
    module: &'m TaskModule,
    shm: SharedMemory,
    messages: Arc<MessageSender>,
    output: TaskOutput,
    runtime: Runtime,
}

impl Worker<'_> {
    fn run_task(&self, task_id: String, payload: ShmPointer) -> io::Result<()> {
        self.messages.send(&WorkerMessage::Acknowledgement {
            task_id: task_id.clone(),
        })?;
        self.output.begin(&task_id);
        default_sigterm();

        let outcome = self.execute(&task_id, &payload);

        ignore_sigterm();
        self.output.finish();

        let message = match outcome.and_then(|value| self.shm.write(&value)) {
            Ok(result) => WorkerMessage::Result { task_id, result },
            Err(error) => WorkerMessage::Problem {
                task_id: Some(task_id),
                error,
            },
        };
        self.messages.send(&message)
    }

    fn execute(&self, task_id: &str, payload: &ShmPointer) -> Result<Value, TaskError> {
        let payload: TaskPayload = self.shm.read(payload)?;
        let function = self
            .module
            .function(&payload.function_name)
            .ok_or_else(|| TaskError::UnknownFunction(payload.function_name.clone()))?;

        let call = TaskCall {
            task_id: task_id.to_owned(),
            args: payload.args,
            kwargs: payload.kwargs,
            progress: ProgressReporter {
                task_id: task_id.to_owned(),
                messages: Some(Arc::clone(&self.messages)),
            },
        };

        tracing::debug!(task_id, function = %payload.function_name, "running task");
        match panic::catch_unwind(AssertUnwindSafe(|| function.call(call, &self.runtime))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::Remote(RemoteError::from_anyhow(&err))),
            Err(panic) => Err(TaskError::Remote(RemoteError::from_panic(
                panic_message(&*panic),
                take_panic_traceback(),
            ))),
        }
    }
}

fn shared_memory_from_env() -> Result<SharedMemory> {
    let defaults = PoolConfig::default();
    let dir = env::var_os(ENV_SHM_DIR)
        .map(PathBuf::from)
        .unwrap_or(defaults.shm_dir);
    let max_size = match env::var(ENV_MAX_PAYLOAD_SIZE) {
        Ok(size) => size
            .parse()
            .with_context(|| format!("invalid {ENV_MAX_PAYLOAD_SIZE} `{size}`"))?,
        Err(_) => defaults.max_payload_size,
    };
    Ok(SharedMemory::new(dir, max_size))
}

/// Runs the worker loop until the pool closes the command pipe.
///
/// This takes over `stdin` and `stdout` of the process and must be called from a plain thread,
/// not from within an async runtime.
pub fn run_worker(modules: &TaskModules) -> Result<()> {
    let module_name =
        env::var(ENV_TASK_MODULE).with_context(|| format!("{ENV_TASK_MODULE} is not set"))?;
    let shm = shared_memory_from_env()?;

    let (protocol, captured, output) = redirect_stdout().context("failed to redirect stdout")?;
    let messages = Arc::new(MessageSender::new(protocol));
    captured.forward(Arc::clone(&messages));

    let Some(module) = modules.get(&module_name) else {
        let error = TaskError::Computation(format!("unknown task module `{module_name}`"));
        messages.send(&WorkerMessage::Problem {
            task_id: None,
            error: error.clone(),
        })?;
        anyhow::bail!(error);
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create task runtime")?;

    install_panic_hook();
    ignore_sigterm();

    let worker = Worker {
        module,
        shm,
        messages,
        output,
        runtime,
    };
    worker.messages.send(&WorkerMessage::Initialization)?;
    tracing::debug!(module = %module_name, "worker initialized");

    let stdin = io::stdin();
    let mut commands = stdin.lock();
    while let Some(command) = channel::read_command(&mut commands)? {
        match command {
            WorkerCommand::Task { task_id, payload } => worker.run_task(task_id, payload)?,
        }
    }

    tracing::debug!("command pipe closed, worker exiting");
    Ok(())
}
