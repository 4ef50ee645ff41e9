//! Lock store behaviour on the in-memory backend.

use std::time::Duration;

use workq::error::ErrorKind;
use workq::lock::LockStore;
use workq::model::LockToken;

#[tokio::test]
async fn second_holder_waits_out_the_ttl() {
    let locks = LockStore::in_memory();
    let first = locks
        .acquire("job-x", Duration::from_millis(1000))
        .await
        .unwrap();

    let err = locks
        .acquire("job-x", Duration::from_millis(1000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyLocked);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let third = locks
        .acquire("job-x", Duration::from_millis(1000))
        .await
        .unwrap();
    assert_ne!(first, third);

    // The first holder lost it.
    let err = locks
        .renew("job-x", &first, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockExpiredOrStolen);
}

#[tokio::test]
async fn renew_keeps_the_lock_past_its_original_ttl() {
    let locks = LockStore::in_memory();
    let token = locks
        .acquire("compaction", Duration::from_millis(150))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let lock = locks
        .renew("compaction", &token, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(lock.name, "compaction");
    assert_eq!(lock.token, token);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = locks
        .acquire("compaction", Duration::from_millis(150))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyLocked);
}

#[tokio::test]
async fn release_requires_the_holders_token() {
    let locks = LockStore::in_memory();
    let token = locks.acquire("job-y", Duration::from_secs(30)).await.unwrap();

    let err = locks
        .release("job-y", &LockToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockExpiredOrStolen);

    locks.release("job-y", &token).await.unwrap();
    // Releasing twice, or releasing a lock nobody holds, is a no-op.
    locks.release("job-y", &token).await.unwrap();
    locks.release("never-taken", &LockToken::new()).await.unwrap();

    locks.acquire("job-y", Duration::from_secs(30)).await.unwrap();
}

#[tokio::test]
async fn names_are_independent() {
    let locks = LockStore::in_memory();
    locks.acquire("a", Duration::from_secs(30)).await.unwrap();
    locks.acquire("b", Duration::from_secs(30)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn exactly_one_of_many_concurrent_acquirers_wins() {
    let locks = LockStore::in_memory();
    let mut tasks = Vec::new();
    for _ in 0..32 {
        let locks = locks.clone();
        tasks.push(tokio::spawn(async move {
            locks.acquire("singleton", Duration::from_secs(30)).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::AlreadyLocked),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn ttl_beyond_the_ceiling_is_rejected_before_touching_the_store() {
    let locks = LockStore::in_memory();
    let huge = Duration::from_secs(u64::MAX);
    let err = locks.acquire("job-x", huge).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedConfiguration);

    // Nothing was taken.
    let token = locks.acquire("job-x", Duration::from_secs(1)).await.unwrap();
    let err = locks.renew("job-x", &token, huge).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedConfiguration);
}
