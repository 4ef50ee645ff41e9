//! Worker pool end to end on the in-memory backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use workq::bus::NotificationBus;
use workq::config::QueueOptions;
use workq::model::{Item, ItemId, NewItem};
use workq::progress::ConsumerProgressStore;
use workq::queue::PriorityQueueStore;
use workq::worker::{Disposition, Handler, Worker, WorkerConfig};

fn queue_with_ttl(ttl: Duration) -> PriorityQueueStore {
    let options = QueueOptions {
        namespace: "events".to_string(),
        expiration_time: ttl,
        ..QueueOptions::default()
    };
    PriorityQueueStore::in_memory(options, NotificationBus::in_memory())
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "test-worker".to_string(),
        concurrency: 8,
        poll_interval: Duration::from_millis(20),
        renewal_margin: 0.5,
    }
}

async fn wait_until_drained(queue: &PriorityQueueStore) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.stats().await.unwrap().pending_items > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue should drain");
}

async fn run_until_drained<H: Handler>(worker: Worker<H>, queue: &PriorityQueueStore) {
    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    wait_until_drained(queue).await;
    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processes_every_item_in_order_and_records_progress() {
    let queue = queue_with_ttl(Duration::from_secs(30));
    let progress = ConsumerProgressStore::in_memory(false);
    let mut enqueued: HashMap<String, Vec<ItemId>> = HashMap::new();
    for round in 0..3 {
        for agg in ["agg-1", "agg-2", "agg-3"] {
            let item = queue
                .enqueue(NewItem::new(agg).priority(round))
                .await
                .unwrap();
            enqueued.entry(agg.to_string()).or_default().push(item.id);
        }
    }

    let seen: Arc<Mutex<HashMap<String, Vec<ItemId>>>> = Arc::default();
    let log = Arc::clone(&seen);
    let handler = move |item: Item| {
        let log = Arc::clone(&log);
        async move {
            log.lock()
                .unwrap()
                .entry(item.unit.discriminator.clone())
                .or_default()
                .push(item.id);
            Disposition::Acknowledge
        }
    };

    let worker = Worker::new(queue.clone(), handler, worker_config())
        .with_progress(progress.clone(), "projector");
    run_until_drained(worker, &queue).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, enqueued);
    for (agg, ids) in &enqueued {
        let last = ids.last().unwrap().0 as i64;
        assert_eq!(progress.get_progress("projector", agg).await.unwrap(), Some(last));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_runs_two_items_of_one_discriminator_at_once() {
    let queue = queue_with_ttl(Duration::from_secs(30));
    for n in 0..12 {
        queue
            .enqueue(NewItem::new(format!("agg-{}", n % 3)))
            .await
            .unwrap();
    }

    let active: Arc<Mutex<HashSet<String>>> = Arc::default();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let (active_in, overlaps_in) = (Arc::clone(&active), Arc::clone(&overlaps));
    let handler = move |item: Item| {
        let active = Arc::clone(&active_in);
        let overlaps = Arc::clone(&overlaps_in);
        async move {
            let discriminator = item.unit.discriminator.clone();
            if !active.lock().unwrap().insert(discriminator.clone()) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
            active.lock().unwrap().remove(&discriminator);
            Disposition::Acknowledge
        }
    };

    let worker = Worker::new(queue.clone(), handler, worker_config());
    run_until_drained(worker, &queue).await;
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deferred_items_are_retried() {
    let queue = queue_with_ttl(Duration::from_secs(30));
    queue.enqueue(NewItem::new("agg-1")).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let handler = move |_item: Item| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Disposition::Defer(Some(Duration::from_millis(50)))
            } else {
                Disposition::Acknowledge
            }
        }
    };

    let worker = Worker::new(queue.clone(), handler, worker_config());
    run_until_drained(worker, &queue).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn abandoned_items_come_back_after_the_lease_expires() {
    let ttl = Duration::from_millis(100);
    let queue = queue_with_ttl(ttl);
    queue.enqueue(NewItem::new("agg-1")).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let handler = move |_item: Item| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Disposition::Abandon
            } else {
                Disposition::Acknowledge
            }
        }
    };

    let worker = Worker::new(queue.clone(), handler, worker_config());
    run_until_drained(worker, &queue).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn renewal_keeps_a_slow_handler_exclusive() {
    let ttl = Duration::from_millis(100);
    let queue = queue_with_ttl(ttl);
    queue.enqueue(NewItem::new("agg-1")).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let handler = move |_item: Item| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            Disposition::Acknowledge
        }
    };

    let worker = Worker::new(queue.clone(), handler, worker_config());
    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    // Well past the original expiry the item is still leased.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(queue.lease("intruder").await.unwrap().is_none());

    wait_until_drained(&queue).await;
    worker.shutdown();
    handle.await.unwrap().unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_before_any_work_returns() {
    let queue = queue_with_ttl(Duration::from_secs(30));
    let handler = |_item: Item| async { Disposition::Acknowledge };
    let worker = Worker::new(queue.clone(), handler, worker_config());

    worker.shutdown();
    tokio::time::timeout(Duration::from_secs(1), worker.run())
        .await
        .expect("run should return after shutdown")
        .unwrap();
    assert_eq!(queue.bus().subscriber_count(queue.channel()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renewals_follow_the_queue_ttl_not_the_worker_defaults() {
    let queue = queue_with_ttl(Duration::from_millis(100));
    queue.enqueue(NewItem::new("agg-1")).await.unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let active: Arc<Mutex<HashSet<String>>> = Arc::default();
    let (runs_in, overlaps_in, active_in) =
        (Arc::clone(&runs), Arc::clone(&overlaps), Arc::clone(&active));
    let handler = move |item: Item| {
        runs_in.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&active_in);
        let overlaps = Arc::clone(&overlaps_in);
        async move {
            let discriminator = item.unit.discriminator.clone();
            if !active.lock().unwrap().insert(discriminator.clone()) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
            active.lock().unwrap().remove(&discriminator);
            Disposition::Acknowledge
        }
    };

    // Default worker settings know nothing about the 100 ms TTL.
    let worker = Worker::new(queue.clone(), handler, WorkerConfig::default());
    run_until_drained(worker, &queue).await;
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn defer_without_a_delay_waits_out_the_queue_requeue_delay() {
    let options = QueueOptions {
        namespace: "events".to_string(),
        requeue_delay: Duration::from_millis(150),
        ..QueueOptions::default()
    };
    let queue = PriorityQueueStore::in_memory(options, NotificationBus::in_memory());
    queue.enqueue(NewItem::new("agg-1")).await.unwrap();

    let attempts: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let log = Arc::clone(&attempts);
    let handler = move |_item: Item| {
        let log = Arc::clone(&log);
        async move {
            let mut attempts = log.lock().unwrap();
            attempts.push(Instant::now());
            if attempts.len() == 1 {
                Disposition::Defer(None)
            } else {
                Disposition::Acknowledge
            }
        }
    };

    let worker = Worker::new(queue.clone(), handler, worker_config());
    run_until_drained(worker, &queue).await;

    let attempts = attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1] - attempts[0] >= Duration::from_millis(140));
}
