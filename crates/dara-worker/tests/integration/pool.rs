use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dara_service::caching::TaskError;
use dara_service::pool::{PoolError, PoolStatus, ProgressUpdate, TaskPool, Value};
use dara_service::utils::futures::wait_while;

use crate::{capture_worker_logs, pool_config, segments, start_pool, submit, test};

#[tokio::test]
async fn test_payload_roundtrip() {
    let (pool, shm_dir) = start_pool(|_| ()).await;

    let data = Bytes::from(vec![7u8; 4 * 1024 * 1024]);
    let handle = submit(&pool, "t1", "echo", vec![Value::Bytes(data.clone())]);
    assert_eq!(handle.task_id(), "t1");
    assert_eq!(handle.wait().await, Ok(Value::Bytes(data)));

    let blob = submit(&pool, "t2", "blob", vec![Value::from(1000)])
        .wait()
        .await
        .unwrap();
    assert_eq!(blob.as_bytes().map(|b| b.len()), Some(1000));

    // both payloads and results are unlinked once read
    assert_eq!(segments(shm_dir.path()), 0);
    assert_eq!(pool.running_tasks(), 0);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_keyword_arguments() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;

    let mut kwargs = BTreeMap::new();
    kwargs.insert("reason".to_owned(), Value::from("out of coffee"));
    let handle = pool.submit("t1", "fail", vec![], kwargs).unwrap();

    let Err(TaskError::Remote(error)) = handle.wait().await else {
        panic!("expected a remote error");
    };
    assert_eq!(error.message, "task failed on request");
    assert_eq!(error.chain, vec!["out of coffee".to_owned()]);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_sync_and_async_functions() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;

    let sleep = submit(&pool, "t1", "sleep", vec![Value::from(0.1)]);
    let wait = submit(&pool, "t2", "wait", vec![Value::from(0.1), Value::from("done")]);

    assert_eq!(sleep.wait().await, Ok(Value::Int(42)));
    assert_eq!(wait.wait().await, Ok(Value::from("done")));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_task_errors() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;

    let Err(TaskError::Remote(error)) = submit(&pool, "t1", "panic", vec![]).wait().await else {
        panic!("expected a remote error");
    };
    assert_eq!(error.message, "task panicked: task panicked on request");
    assert!(error.traceback.is_some());

    let Err(TaskError::Remote(error)) = submit(&pool, "t2", "sleep", vec![]).wait().await else {
        panic!("expected a remote error");
    };
    assert_eq!(error.message, "missing positional argument 0");

    let result = submit(&pool, "t3", "nope", vec![]).wait().await;
    assert_eq!(result, Err(TaskError::UnknownFunction("nope".into())));

    // the worker survives failing tasks
    let result = submit(&pool, "t4", "echo", vec![Value::from(1)]).wait().await;
    assert_eq!(result, Ok(Value::Int(1)));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_running_task() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;

    let handle = submit(&pool, "t1", "sleep", vec![Value::from(30)]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(pool.cancel("t1").await.unwrap());
    assert_eq!(handle.wait().await, Err(TaskError::Cancelled));
    assert!(!pool.cancel("t1").await.unwrap());

    // a new worker takes over
    let result = submit(&pool, "t2", "echo", vec![Value::from("still here")])
        .wait()
        .await;
    assert_eq!(result, Ok(Value::from("still here")));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_worker_crash() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;

    let result = submit(&pool, "t1", "crash", vec![]).wait().await;
    assert_eq!(result, Err(TaskError::WorkerFailure));

    let result = submit(&pool, "t2", "echo", vec![Value::from(2)]).wait().await;
    assert_eq!(result, Ok(Value::Int(2)));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_progress() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;

    let updates = Arc::new(Mutex::new(Vec::<ProgressUpdate>::new()));
    let recorded = Arc::clone(&updates);
    pool.on_progress(
        "t1",
        Arc::new(move |update: ProgressUpdate| recorded.lock().unwrap().push(update)),
    );

    let result = submit(&pool, "t1", "progress", vec![Value::from(4)]).wait().await;
    assert_eq!(result, Ok(Value::Int(4)));

    let updates = updates.lock().unwrap().clone();
    let progress: Vec<f64> = updates.iter().map(|update| update.progress).collect();
    assert_eq!(progress, vec![25.0, 50.0, 75.0, 100.0]);
    assert_eq!(updates[0].task_id, "t1");
    assert_eq!(updates[3].message, "step 4");

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_printing_task() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;
    let (logs, _guard) = capture_worker_logs();

    // printed lines become log messages and never corrupt the protocol
    let args = vec![Value::from("{\"type\":\"initialization\"}"), Value::from("hello")];
    let result = submit(&pool, "t1", "print", args).wait().await;
    assert_eq!(result, Ok(Value::Int(2)));

    let t1 = Some("t1".to_owned());
    assert_eq!(
        logs.lines(),
        [
            (t1.clone(), "{\"type\":\"initialization\"}".to_owned()),
            (t1, "hello".to_owned()),
        ]
    );

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_submit_rejected() {
    test::setup();
    let shm_dir = test::tempdir();
    let pool = TaskPool::new(pool_config(shm_dir.path()));

    let err = pool
        .submit("t1", "echo", vec![], BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, PoolError::NotRunning(PoolStatus::Created)));

    pool.start().await.unwrap();
    let _handle = submit(&pool, "t1", "sleep", vec![Value::from(0.2)]);
    let err = pool
        .submit("t1", "echo", vec![], BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, PoolError::DuplicateTask(id) if id == "t1"));

    pool.close();
    assert_eq!(pool.status(), PoolStatus::Closed);
    let err = pool
        .submit("t2", "echo", vec![], BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, PoolError::NotRunning(PoolStatus::Closed)));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_join_waits_for_tasks() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;

    let handle = submit(&pool, "t1", "sleep", vec![Value::from(0.2)]);
    pool.join(None).await.unwrap();

    assert_eq!(handle.try_get(), Some(Ok(Value::Int(42))));
    assert_eq!(pool.status(), PoolStatus::Stopped);
    assert_eq!(pool.worker_count(), 0);
}

#[tokio::test]
async fn test_stop_fails_remaining_tasks() {
    let (pool, shm_dir) = start_pool(|config| config.max_workers = NonZeroUsize::MIN).await;

    let running = submit(&pool, "t1", "sleep", vec![Value::from(30)]);
    let queued = submit(&pool, "t2", "echo", vec![Value::from(1)]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    pool.stop().await.unwrap();
    assert_eq!(running.wait().await, Err(TaskError::PoolStopped));
    assert_eq!(queued.wait().await, Err(TaskError::PoolStopped));
    assert_eq!(segments(shm_dir.path()), 0);
}

#[tokio::test]
async fn test_startup_timeout() {
    test::setup();
    let shm_dir = test::tempdir();
    let mut config = pool_config(shm_dir.path());
    // never sends an initialization message
    config.worker_executable = Some("/bin/cat".into());
    config.startup_timeout = Duration::from_millis(300);

    let pool = TaskPool::new(config);
    let err = pool.start().await.unwrap_err();
    assert!(matches!(err, PoolError::StartupTimeout(_)));
    assert_eq!(pool.status(), PoolStatus::Error);
    assert_eq!(pool.worker_count(), 0);
}

#[tokio::test]
async fn test_scales_workers() {
    let (pool, _shm_dir) = start_pool(|config| {
        config.max_workers = NonZeroUsize::new(3).unwrap();
        config.worker_timeout = Duration::from_millis(100);
    })
    .await;
    assert_eq!(pool.worker_count(), 1);

    let handles: Vec<_> = (0..5)
        .map(|i| submit(&pool, &format!("t{i}"), "sleep", vec![Value::from(0.2), Value::from(i)]))
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.wait().await, Ok(Value::Int(i as i64)));
    }

    // idle workers beyond the single spare one are stopped again
    let trimmed = wait_while(|| pool.worker_count() > 1, Duration::from_secs(5)).await;
    assert!(trimmed);
    assert_eq!(pool.worker_count(), 1);

    pool.stop().await.unwrap();
}
