//! Consumer progress store behaviour on the in-memory backend.

use workq::error::{Error, ErrorKind};
use workq::progress::ConsumerProgressStore;

#[tokio::test]
async fn missing_progress_means_start_from_the_beginning() {
    let store = ConsumerProgressStore::in_memory(false);
    assert_eq!(store.get_progress("flow", "orders").await.unwrap(), None);
}

#[tokio::test]
async fn positions_only_move_forward() {
    let store = ConsumerProgressStore::in_memory(false);

    store.set_progress("flow", "orders", 5).await.unwrap();
    let err = store.set_progress("flow", "orders", 3).await.unwrap_err();
    match err {
        Error::ProgressRegression {
            current, attempted, ..
        } => {
            assert_eq!(current, 5);
            assert_eq!(attempted, 3);
        }
        other => panic!("expected ProgressRegression, got {other:?}"),
    }
    assert_eq!(store.get_progress("flow", "orders").await.unwrap(), Some(5));

    let record = store.set_progress("flow", "orders", 7).await.unwrap();
    assert_eq!(record.consumer_name, "flow");
    assert_eq!(record.partition, "orders");
    assert_eq!(record.position, 7);
    assert_eq!(store.get_progress("flow", "orders").await.unwrap(), Some(7));
}

#[tokio::test]
async fn replay_mode_accepts_any_position() {
    let store = ConsumerProgressStore::in_memory(true);
    store.set_progress("flow", "orders", 9).await.unwrap();
    store.set_progress("flow", "orders", 2).await.unwrap();
    assert_eq!(store.get_progress("flow", "orders").await.unwrap(), Some(2));
}

#[tokio::test]
async fn reset_forgets_every_partition_of_a_consumer() {
    let store = ConsumerProgressStore::in_memory(false);
    store.set_progress("flow", "orders", 9).await.unwrap();
    store.set_progress("flow", "invoices", 4).await.unwrap();
    store.set_progress("report", "orders", 1).await.unwrap();

    assert_eq!(store.reset("flow").await.unwrap(), 2);
    assert_eq!(store.get_progress("flow", "orders").await.unwrap(), None);
    assert_eq!(store.get_progress("report", "orders").await.unwrap(), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_writers_never_move_progress_backwards() {
    let store = ConsumerProgressStore::in_memory(false);
    let mut tasks = Vec::new();
    for position in (1..=100).rev() {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.set_progress("flow", "orders", position).await
        }));
    }

    for task in tasks {
        if let Err(e) = task.await.unwrap() {
            assert_eq!(e.kind(), ErrorKind::ProgressRegression);
        }
    }
    assert_eq!(store.get_progress("flow", "orders").await.unwrap(), Some(100));
}
