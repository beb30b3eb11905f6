use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dara_service::config::PoolConfig;
use dara_service::pool::{TaskPool, Value};
pub use dara_service::test::{self, TempDir};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;

/// Creates a pool configuration running the `builtin` module of the `dara-worker` under test.
///
/// Shared memory segments go to `shm_dir` instead of `/dev/shm`, so tests can inspect them.
pub fn pool_config(shm_dir: &Path) -> PoolConfig {
    PoolConfig {
        enabled: true,
        max_workers: NonZeroUsize::new(2).unwrap(),
        worker_timeout: Duration::from_secs(60),
        startup_timeout: Duration::from_secs(30),
        terminate_timeout: Duration::from_secs(2),
        task_module: "builtin".into(),
        worker_executable: Some(env!("CARGO_BIN_EXE_dara-worker").into()),
        shm_dir: shm_dir.to_owned(),
        ..Default::default()
    }
}

/// Starts a pool for tests.
///
/// This returns the pool and the temporary shared memory directory, which must be held until the
/// test has finished. The `update_config` closure can modify the configuration before the pool is
/// started.
pub async fn start_pool(update_config: impl FnOnce(&mut PoolConfig)) -> (TaskPool, TempDir) {
    test::setup();

    let shm_dir = test::tempdir();
    let mut config = pool_config(shm_dir.path());
    update_config(&mut config);

    let pool = TaskPool::new(config);
    pool.start().await.unwrap();
    (pool, shm_dir)
}

/// Submits a task without keyword arguments.
#[track_caller]
pub fn submit(
    pool: &TaskPool,
    task_uid: &str,
    function_name: &str,
    args: Vec<Value>,
) -> dara_service::pool::TaskHandle {
    pool.submit(task_uid, function_name, args, BTreeMap::new())
        .unwrap()
}

/// The number of shared memory segments left in `dir`.
pub fn segments(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("dara-"))
        .count()
}

/// Lines printed by workers, as `(task_id, line)` pairs in the order the pool logged them.
#[derive(Clone, Debug, Default)]
pub struct WorkerLogs(Arc<Mutex<Vec<(Option<String>, String)>>>);

impl WorkerLogs {
    pub fn lines(&self) -> Vec<(Option<String>, String)> {
        self.0.lock().unwrap().clone()
    }
}

impl<S: Subscriber> Layer<S> for WorkerLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != "dara::worker" {
            return;
        }
        let mut line = WorkerLine::default();
        event.record(&mut line);
        self.0.lock().unwrap().push((line.task_id, line.message));
    }
}

#[derive(Default)]
struct WorkerLine {
    task_id: Option<String>,
    message: String,
}

impl Visit for WorkerLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "task_id" {
            self.task_id = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

/// Records the worker output the pool logs on the current thread.
///
/// Only works on a single threaded runtime, and only while the returned guard is held.
pub fn capture_worker_logs() -> (WorkerLogs, DefaultGuard) {
    let logs = WorkerLogs::default();
    let guard = tracing::subscriber::set_default(Registry::default().with(logs.clone()));
    (logs, guard)
}
