//! Distributed lock integration tests.
//!
//! Two storages opened with separate writer-lock registries stand in for
//! two processes sharing one database file.

mod common;

use common::{count_rows, TestFixture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stockpile::{with_lock, CancellationToken, Storage, StorageError, StorageOptions};

async fn second_process(fixture: &TestFixture) -> Storage {
    Storage::open(&fixture.db_path, StorageOptions::test_options())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_lock_excludes_other_process() {
    let fixture = TestFixture::new();
    let a = fixture.storage().await;
    let b = second_process(&fixture).await;

    let held = a
        .acquire_lock("jobs:cleanup", Duration::from_secs(1))
        .await
        .unwrap();

    let started = Instant::now();
    let result = b
        .acquire_lock("jobs:cleanup", Duration::from_millis(1500))
        .await;
    match result {
        Err(StorageError::LockTimeout { resource, .. }) => assert_eq!(resource, "jobs:cleanup"),
        other => panic!("expected lock timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(1500));

    // The failed attempt left the holder's row alone.
    assert_eq!(count_rows(&a, &a.tables().lock, "").await, 1);

    held.release().await.unwrap();
    assert_eq!(count_rows(&a, &a.tables().lock, "").await, 0);
}

#[tokio::test]
async fn test_waiter_acquires_after_release() {
    let fixture = TestFixture::new();
    let a = fixture.storage().await;
    let b = second_process(&fixture).await;

    let held = a
        .acquire_lock("resource", Duration::from_secs(1))
        .await
        .unwrap();

    let waiter = tokio::spawn(async move {
        let lock = b.acquire_lock("resource", Duration::from_secs(10)).await?;
        lock.release().await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    held.release().await.unwrap();

    waiter.await.unwrap().unwrap();
    assert_eq!(count_rows(&a, &a.tables().lock, "").await, 0);
}

#[tokio::test]
async fn test_different_resources_do_not_block() {
    let fixture = TestFixture::new();
    let storage = fixture.storage().await;

    let first = storage
        .acquire_lock("one", Duration::from_millis(100))
        .await
        .unwrap();
    let second = storage
        .acquire_lock("two", Duration::from_millis(100))
        .await
        .unwrap();

    assert_eq!(first.resource(), "one");
    assert_eq!(second.resource(), "two");

    second.release().await.unwrap();
    first.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_with_lock_serializes_critical_sections() {
    let fixture = TestFixture::new();
    let storage = fixture.storage().await;
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let storage = storage.clone();
        let inside = inside.clone();
        let overlaps = overlaps.clone();
        handles.push(tokio::spawn(async move {
            with_lock(
                &storage,
                "critical",
                Duration::from_secs(10),
                &CancellationToken::new(),
                || async {
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(count_rows(&storage, &storage.tables().lock, "").await, 0);
}
