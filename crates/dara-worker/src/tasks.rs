//! The `builtin` task module.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dara_service::pool::Value;
use dara_service::pool::worker::{TaskCall, TaskModule};

fn seconds(value: &Value) -> Result<Duration> {
    let seconds = value
        .as_float()
        .with_context(|| format!("expected a number of seconds, got {}", value.kind()))?;
    Duration::try_from_secs_f64(seconds).context("invalid duration")
}

/// Returns its first argument.
fn echo(call: TaskCall) -> Result<Value> {
    Ok(call.args.into_iter().next().unwrap_or_default())
}

/// Blocks for `args[0]` seconds, then returns `args[1]`, or `42` without one.
fn sleep(call: TaskCall) -> Result<Value> {
    let duration = seconds(call.arg(0)?)?;
    tracing::trace!(task_id = %call.task_id, ?duration, "sleeping");
    std::thread::sleep(duration);
    Ok(call.args.get(1).cloned().unwrap_or(Value::Int(42)))
}

/// Like `sleep`, but on the worker's async runtime.
async fn wait(call: TaskCall) -> Result<Value> {
    tokio::time::sleep(seconds(call.arg(0)?)?).await;
    Ok(call.args.get(1).cloned().unwrap_or(Value::Int(42)))
}

fn fail(call: TaskCall) -> Result<Value> {
    let reason = call
        .kwarg("reason")
        .and_then(Value::as_str)
        .unwrap_or("no reason given");
    Err(anyhow::anyhow!("{reason}")).context("task failed on request")
}

fn panic(_call: TaskCall) -> Result<Value> {
    panic!("task panicked on request");
}

/// Terminates the worker process without reporting back.
fn crash(call: TaskCall) -> Result<Value> {
    tracing::warn!(task_id = %call.task_id, "aborting worker on request");
    std::process::abort();
}

/// Reports `args[0]` progress steps and returns their number.
fn progress(call: TaskCall) -> Result<Value> {
    let steps = call.arg(0)?.as_int().context("expected a number of steps")?;
    for step in 1..=steps {
        call.report_progress(step as f64 * 100.0 / steps as f64, format!("step {step}"));
    }
    Ok(Value::Int(steps))
}

/// Prints every argument on its own line and returns how many lines were printed.
fn print(call: TaskCall) -> Result<Value> {
    for arg in &call.args {
        match arg.as_str() {
            Some(line) => println!("{line}"),
            None => println!("{arg:?}"),
        }
    }
    Ok(Value::Int(call.args.len() as i64))
}

/// Returns a blob of `args[0]` bytes.
fn blob(call: TaskCall) -> Result<Value> {
    let size = call.arg(0)?.as_int().context("expected a size")?;
    let size = usize::try_from(size).context("invalid blob size")?;
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    Ok(Value::Bytes(Bytes::from(data)))
}

pub fn builtin() -> TaskModule {
    TaskModule::new("builtin")
        .with_sync("echo", echo)
        .with_sync("sleep", sleep)
        .with_async("wait", wait)
        .with_sync("fail", fail)
        .with_sync("panic", panic)
        .with_sync("crash", crash)
        .with_sync("progress", progress)
        .with_sync("print", print)
        .with_sync("blob", blob)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn call(args: Vec<Value>) -> TaskCall {
        TaskCall::new("t1", args, BTreeMap::new())
    }

    #[test]
    fn test_echo() {
        assert_eq!(echo(call(vec![Value::from("hi")])).unwrap(), Value::from("hi"));
        assert_eq!(echo(call(vec![])).unwrap(), Value::Null);
    }

    #[test]
    fn test_sleep_rejects_bad_input() {
        let err = sleep(call(vec![Value::from("soon")])).unwrap_err();
        assert_eq!(err.to_string(), "expected a number of seconds, got str");
        assert!(sleep(call(vec![Value::from(-1.0)])).is_err());
    }

    #[test]
    fn test_fail() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("reason".to_owned(), Value::from("disk on fire"));
        let err = fail(TaskCall::new("t1", vec![], kwargs)).unwrap_err();
        assert_eq!(format!("{err:#}"), "task failed on request: disk on fire");
    }

    #[test]
    fn test_blob() {
        let value = blob(call(vec![Value::from(300)])).unwrap();
        let data = value.as_bytes().unwrap();
        assert_eq!(data.len(), 300);
        assert_eq!(data[251], 0);
        assert_eq!(data[252], 1);
    }
}
