//! Dara worker.
//!
//! The worker executable spawned by the task pool. It runs the task functions of the module named
//! by `DARA_TASK_MODULE`, see [`dara_service::pool::worker`].

#![warn(missing_debug_implementations, clippy::all)]

use dara_service::config::Config;
use dara_service::logging;
use dara_service::pool::worker::{TaskModules, run_worker};

mod tasks;

fn main() {
    // SAFETY: No other threads have been spawned yet.
    unsafe { logging::init_logging(&Config::default()) };

    tracing::debug!(pid = std::process::id(), "worker starting");
    let modules = TaskModules::new().with(tasks::builtin());
    match run_worker(&modules) {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
