//! Expiration sweeper integration tests.

mod common;

use common::{count_rows, seed_counters, wait_for, TestFixture};
use std::time::Duration;
use stockpile::{
    now_millis, CancellationToken, ExpirationManager, JobState, Storage, StorageError,
    StorageOptions,
};

fn fast_manager(storage: &Storage) -> ExpirationManager {
    storage
        .expiration_manager()
        .with_delay_between_passes(Duration::from_millis(5))
}

#[tokio::test]
async fn test_sweep_deletes_in_bounded_passes() {
    let fixture = TestFixture::new();
    let storage = fixture.storage().await;
    let past = now_millis() - 60_000;

    seed_counters(&storage, "stats:old", 2500, Some(past)).await;

    let report = fast_manager(&storage)
        .execute(&CancellationToken::new())
        .await
        .unwrap();

    let counter = &report.tables[0];
    assert_eq!(counter.table, storage.tables().counter);
    assert_eq!(counter.passes, vec![1000, 1000, 500]);
    assert!(counter.passes.iter().all(|n| *n <= 1000));
    assert_eq!(report.removed(), 2500);
    assert_eq!(count_rows(&storage, &storage.tables().counter, "").await, 0);
}

#[tokio::test]
async fn test_sweep_keeps_unexpired_rows() {
    let fixture = TestFixture::new();
    let storage = fixture.storage().await;
    let now = now_millis();

    seed_counters(&storage, "expired", 3, Some(now - 1_000)).await;
    seed_counters(&storage, "future", 4, Some(now + 3_600_000)).await;
    seed_counters(&storage, "forever", 5, None).await;

    let report = fast_manager(&storage)
        .execute(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.removed(), 3);

    let reader = storage.reader();
    assert_eq!(reader.counter("expired").await.unwrap(), 0);
    assert_eq!(reader.counter("future").await.unwrap(), 4);
    assert_eq!(reader.counter("forever").await.unwrap(), 5);
}

#[tokio::test]
async fn test_sweep_covers_every_expirable_table() {
    let fixture = TestFixture::new();
    let storage = fixture.storage().await;

    let expired_job = storage
        .create_expired_job("{}", Duration::ZERO)
        .await
        .unwrap();
    let kept_job = storage
        .create_expired_job("{}", Duration::from_secs(3600))
        .await
        .unwrap();

    let mut tx = storage.transaction();
    tx.set_job_state(&expired_job, JobState::new("Succeeded"))
        .set_job_state(&kept_job, JobState::new("Scheduled"))
        .insert_to_list("l", "v")
        .expire_list("l", Duration::ZERO)
        .add_to_set("s", "v", 1.0)
        .expire_set("s", Duration::ZERO)
        .set_range_in_hash("h", [("f", "v")])
        .expire_hash("h", Duration::ZERO)
        .increment_counter("c", Some(Duration::ZERO));
    tx.commit().await.unwrap();

    // ExpireAt must be strictly in the past.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = fast_manager(&storage)
        .execute(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.tables.len(), 5);
    assert_eq!(report.removed(), 5);

    let tables = storage.tables();
    for table in [&tables.list, &tables.set, &tables.hash, &tables.counter] {
        assert_eq!(count_rows(&storage, table, "").await, 0, "{table} not swept");
    }

    let reader = storage.reader();
    assert!(reader.job(&expired_job).await.unwrap().is_none());
    assert!(reader.job(&kept_job).await.unwrap().is_some());

    // State history goes with its job.
    assert!(reader.job_states(&expired_job).await.unwrap().is_empty());
    assert_eq!(reader.job_states(&kept_job).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sweep_observes_cancellation() {
    let fixture = TestFixture::new();
    let storage = fixture.storage().await;
    seed_counters(&storage, "old", 30, Some(now_millis() - 1_000)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = storage
        .expiration_manager()
        .with_batch_size(10)
        .execute(&cancel)
        .await;
    assert!(matches!(result, Err(StorageError::Cancelled)));

    // Cancelled before the first pass: nothing deleted, no lock left behind.
    assert_eq!(count_rows(&storage, &storage.tables().counter, "").await, 30);
    assert_eq!(count_rows(&storage, &storage.tables().lock, "").await, 0);
}

#[tokio::test]
async fn test_sweep_waits_for_sweeper_lock() {
    let fixture = TestFixture::new();
    let storage = fixture.storage().await;
    seed_counters(&storage, "old", 1, Some(now_millis() - 1_000)).await;

    let held = storage
        .acquire_lock("locks:expirationmanager", Duration::from_secs(1))
        .await
        .unwrap();

    let result = fast_manager(&storage)
        .with_lock_timeout(Duration::from_millis(200))
        .execute(&CancellationToken::new())
        .await;
    assert!(matches!(result, Err(StorageError::LockTimeout { .. })));
    assert_eq!(count_rows(&storage, &storage.tables().counter, "").await, 1);

    held.release().await.unwrap();
}

#[tokio::test]
async fn test_run_loop_sweeps_until_cancelled() {
    let fixture = TestFixture::new();
    let storage = fixture.storage().await;

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(fast_manager(&storage).run(cancel.clone()));

    // Rows expiring after the loop started are picked up on a later sweep.
    seed_counters(&storage, "late", 3, Some(now_millis() - 1_000)).await;

    let storage_ref = &storage;
    let counter = storage.tables().counter.clone();
    let counter = &counter;
    let swept = wait_for(Duration::from_secs(5), move || async move {
        count_rows(storage_ref, counter, "").await == 0
    })
    .await;
    assert!(swept, "late rows were never swept");

    cancel.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(5), sweeper).await;
    assert!(stopped.is_ok(), "sweeper did not stop after cancellation");
}

#[tokio::test]
async fn test_manager_uses_configured_check_interval() {
    let fixture = TestFixture::new();
    let storage = fixture
        .storage_with(StorageOptions {
            job_expiration_check_interval: Duration::from_millis(75),
            ..StorageOptions::test_options()
        })
        .await;

    let manager = storage.expiration_manager();
    assert_eq!(manager.check_interval(), Duration::from_millis(75));
}
