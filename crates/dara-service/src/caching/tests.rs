use std::time::Duration;

use crate::test::{self, lru_entry, recording_store};

use super::*;

#[test]
fn test_lru_entry_end_to_end() {
    test::setup();
    let (store, _sink) = recording_store::<u64>();
    let entry = lru_entry("derived-1", 3);
    let identity = Identity::anonymous();

    for (key, value) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
        store
            .set(&entry, &identity, key, CacheValue::Ready(value), false)
            .unwrap();
    }

    let get = |key| {
        store
            .get(&entry, &identity, key, false, false)
            .unwrap()
            .and_then(CacheValue::into_ready)
    };
    assert_eq!(get("a"), None);
    assert_eq!(get("b"), Some(2));
    assert_eq!(get("c"), Some(3));
    assert_eq!(get("d"), Some(4));
}

#[test]
fn test_missing_policy() {
    let (store, _sink) = recording_store::<u64>();
    let entry = RegistryEntry::new("plain", None);

    let err = store
        .set(&entry, &Identity::anonymous(), "a", CacheValue::Ready(1), false)
        .unwrap_err();
    assert_eq!(err, CacheError::MissingPolicy("plain".into()));

    // reading an entry without a cache is a miss, not an error
    assert_eq!(
        store.get(&entry, &Identity::anonymous(), "a", false, false),
        Ok(None)
    );
}

#[test]
fn test_entries_and_scopes_are_isolated() {
    let (store, _sink) = recording_store::<u64>();
    let session = RegistryEntry::cached(
        "per-session",
        CachePolicy::keep_all().with_cache_type(CacheType::Session),
    );
    let global = RegistryEntry::cached("global", CachePolicy::keep_all());
    let alice = Identity::session("s1").with_user("alice");
    let bob = Identity::session("s2").with_user("bob");

    store
        .set(&session, &alice, "k", CacheValue::Ready(1), false)
        .unwrap();
    store
        .set(&global, &alice, "k", CacheValue::Ready(2), false)
        .unwrap();

    assert_eq!(
        store.get(&session, &alice, "k", false, false),
        Ok(Some(CacheValue::Ready(1)))
    );
    assert_eq!(store.get(&session, &bob, "k", false, false), Ok(None));
    assert_eq!(
        store.get(&global, &bob, "k", false, false),
        Ok(Some(CacheValue::Ready(2)))
    );

    assert_eq!(
        store.get(&session, &Identity::anonymous(), "k", false, false),
        Err(CacheError::MissingScope(CacheType::Session))
    );
}

#[tokio::test]
async fn test_set_resolves_pending_task() {
    test::setup();
    let (store, _sink) = recording_store::<u64>();
    let entry = lru_entry("derived", 2);
    let identity = Identity::anonymous();

    let task = store
        .set_pending_task(&entry, &identity, "k", "task-1")
        .unwrap();

    let waiter = tokio::spawn({
        let task = task.clone();
        async move { task.run().await }
    });

    let previous = store
        .set(&entry, &identity, "k", CacheValue::Ready(42), false)
        .unwrap();
    assert_eq!(previous, Some(CacheValue::Task(task.clone())));
    assert_eq!(waiter.await.unwrap(), Ok(42));
    assert_eq!(store.get_or_wait(&entry, &identity, "k").await, Ok(Some(42)));
}

#[tokio::test]
async fn test_get_or_wait_on_placeholder() {
    let (store, _sink) = recording_store::<String>();
    let store = std::sync::Arc::new(store);
    let entry = RegistryEntry::cached("derived", CachePolicy::ttl(Duration::from_secs(60)));

    let pending = store
        .set_pending_value(&entry, &Identity::anonymous(), "k")
        .unwrap();

    let waiter = tokio::spawn({
        let store = store.clone();
        let entry = entry.clone();
        async move {
            store
                .get_or_wait(&entry, &Identity::anonymous(), "k")
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    pending.resolve("computed".into());
    assert_eq!(waiter.await.unwrap(), Ok(Some("computed".to_owned())));

    // the placeholder is still stored, but resolved
    assert!(store.get(&entry, &Identity::anonymous(), "k", false, false).unwrap().is_some());
    assert_eq!(
        store.get_or_wait(&entry, &Identity::anonymous(), "missing").await,
        Ok(None)
    );
}

#[tokio::test]
async fn test_get_or_wait_propagates_failure() {
    let (store, _sink) = recording_store::<u64>();
    let entry = lru_entry("derived", 1);
    let pending = store
        .set_pending_value(&entry, &Identity::anonymous(), "k")
        .unwrap();
    pending.fail(TaskError::WorkerFailure);

    assert_eq!(
        store.get_or_wait(&entry, &Identity::anonymous(), "k").await,
        Err(WaitError::Task(TaskError::WorkerFailure))
    );
}

#[test]
fn test_size_is_published() {
    let (store, sink) = recording_store::<String>();
    let entry = lru_entry("derived", 1);
    let identity = Identity::anonymous();

    store
        .set(&entry, &identity, "a", CacheValue::Ready("x".repeat(1000)), false)
        .unwrap();
    let with_a = sink.last().unwrap();
    assert!(with_a >= 1000);
    assert_eq!(store.total_size(), with_a);

    // evicts `a`
    store
        .set(&entry, &identity, "b", CacheValue::Ready("y".into()), false)
        .unwrap();
    assert!(sink.last().unwrap() < with_a);

    store.delete(&entry, &identity, "b").unwrap();
    assert_eq!(sink.last(), Some(0));

    store
        .set(&entry, &identity, "c", CacheValue::Ready("z".into()), false)
        .unwrap();
    store.clear();
    assert_eq!(store.total_size(), 0);
    assert_eq!(sink.last(), Some(0));
    assert_eq!(sink.sizes().len(), 5);
}

#[test]
fn test_placeholders_are_pinned() {
    let (store, _sink) = recording_store::<u64>();
    let entry = lru_entry("derived-1", 1);
    let identity = Identity::anonymous();

    let pending = store.set_pending_value(&entry, &identity, "a").unwrap();
    store
        .set(&entry, &identity, "b", CacheValue::Ready(2), false)
        .unwrap();
    assert_eq!(
        store.get(&entry, &identity, "a", false, false).unwrap(),
        Some(CacheValue::Pending(pending.clone()))
    );
    assert_eq!(store.get(&entry, &identity, "b", false, false).unwrap(), None);

    let previous = store.fulfill(&entry, &identity, "a", 1).unwrap();
    assert_eq!(previous, Some(CacheValue::Pending(pending.clone())));
    assert_eq!(pending.try_get(), Some(Ok(1)));

    // the result is evictable like any other value
    store
        .set(&entry, &identity, "b", CacheValue::Ready(2), false)
        .unwrap();
    assert_eq!(store.get(&entry, &identity, "a", false, false).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_pending_task_outlives_ttl() {
    let (store, _sink) = recording_store::<u64>();
    let entry = RegistryEntry::cached("derived-1", CachePolicy::ttl(Duration::from_millis(50)));
    let identity = Identity::anonymous();

    let task = store.set_pending_task(&entry, &identity, "a", "t1").unwrap();
    tokio::time::advance(Duration::from_millis(200)).await;
    assert_eq!(
        store.get(&entry, &identity, "a", false, false).unwrap(),
        Some(CacheValue::Task(task.clone()))
    );

    store.fulfill(&entry, &identity, "a", 7).unwrap();
    assert_eq!(task.run().await, Ok(7));
    tokio::time::advance(Duration::from_millis(60)).await;
    assert_eq!(store.get(&entry, &identity, "a", false, false).unwrap(), None);
}
