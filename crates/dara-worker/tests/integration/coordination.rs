use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dara_service::caching::{CacheValue, Identity, TaskError};
use dara_service::coordination::Coordinator;
use dara_service::pool::Value;
use dara_service::utils::futures::wait_while;

use crate::{start_pool, test};

#[tokio::test]
async fn test_submit_at_most_once() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;
    let (store, _sink) = test::recording_store();
    let coordinator = Coordinator::new(Arc::new(store));
    let entry = test::lru_entry("var", 10);
    let identity = Identity::anonymous();
    let args = || vec![Value::from(0.3), Value::from("computed")];

    let first = coordinator
        .get_or_submit(&entry, &identity, "k", &pool, "sleep", args(), BTreeMap::new())
        .await
        .unwrap();
    let second = coordinator
        .get_or_submit(&entry, &identity, "k", &pool, "sleep", args(), BTreeMap::new())
        .await
        .unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(first.subscribers(), 2);
    assert_eq!(pool.running_tasks(), 1);

    assert_eq!(first.run().await, Ok(Value::from("computed")));
    assert_eq!(second.run().await, Ok(Value::from("computed")));

    // the result is written back, later callers get it without touching the pool
    let stored = wait_while(
        || {
            let cached = coordinator
                .store()
                .get(&entry, &identity, "k", false, false)
                .unwrap();
            !matches!(cached, Some(CacheValue::Ready(_)))
        },
        Duration::from_secs(1),
    )
    .await;
    assert!(stored);

    let third = coordinator
        .get_or_submit(&entry, &identity, "k", &pool, "sleep", args(), BTreeMap::new())
        .await
        .unwrap();
    assert!(!third.ptr_eq(&first));
    assert_eq!(third.try_get(), Some(Ok(Value::from("computed"))));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_needs_all_subscribers() {
    let (pool, _shm_dir) = start_pool(|_| ()).await;
    let (store, _sink) = test::recording_store();
    let coordinator = Coordinator::new(Arc::new(store));
    let entry = test::lru_entry("var", 10);
    let identity = Identity::anonymous();

    let mut subscribers = Vec::new();
    for _ in 0..2 {
        let task = coordinator
            .get_or_submit(
                &entry,
                &identity,
                "k",
                &pool,
                "sleep",
                vec![Value::from(30)],
                BTreeMap::new(),
            )
            .await
            .unwrap();
        subscribers.push(task);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!subscribers[0].cancel().await);
    assert_eq!(subscribers[0].try_get(), None);
    assert_eq!(pool.running_tasks(), 1);

    assert!(subscribers[1].cancel().await);
    assert_eq!(subscribers[0].run().await, Err(TaskError::Cancelled));
    assert_eq!(pool.running_tasks(), 0);

    // the failed placeholder is dropped, the next caller starts over
    let cleared = wait_while(
        || {
            coordinator
                .store()
                .get(&entry, &identity, "k", false, false)
                .unwrap()
                .is_some()
        },
        Duration::from_secs(1),
    )
    .await;
    assert!(cleared);

    let retry = coordinator
        .get_or_submit(
            &entry,
            &identity,
            "k",
            &pool,
            "echo",
            vec![Value::from(7)],
            BTreeMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(retry.run().await, Ok(Value::Int(7)));

    pool.stop().await.unwrap();
}
