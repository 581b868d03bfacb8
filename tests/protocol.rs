//! End-to-end properties of the delivery and recovery protocol, run against
//! the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rmq::{
    BatchConsumer, Cleaner, Connection, ConnectionConfig, Consumer, Deliveries, Delivery,
    DeliveryState, MemoryStore, Queue, Store,
};

const TTL: Duration = Duration::from_millis(100);
const PAST_TTL: Duration = Duration::from_millis(300);

fn config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_heartbeat_ttl(TTL)
}

async fn open(tag: &str, store: &Arc<MemoryStore>) -> Connection {
    Connection::open(tag, store.clone(), config()).await.unwrap()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

/// Holds on to every delivery without finishing it, like a consumer that
/// is about to crash.
#[derive(Clone, Default)]
struct Hoarder {
    held: Arc<Mutex<Vec<Delivery>>>,
}

#[async_trait]
impl Consumer for Hoarder {
    async fn consume(&self, delivery: Delivery) {
        self.held.lock().unwrap().push(delivery);
    }
}

#[derive(Clone, Default)]
struct Acker {
    acked: Arc<AtomicUsize>,
}

#[async_trait]
impl Consumer for Acker {
    async fn consume(&self, mut delivery: Delivery) {
        if delivery.ack().await.unwrap() {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone, Default)]
struct BatchAcker {
    acked: Arc<AtomicUsize>,
}

#[async_trait]
impl BatchConsumer for BatchAcker {
    async fn consume(&self, mut batch: Deliveries) {
        let size = batch.len();
        let failed = batch.ack().await;
        self.acked.fetch_add(size - failed, Ordering::SeqCst);
    }
}

async fn totals(queue: &Queue) -> (usize, usize, usize) {
    (
        queue.ready_count().await.unwrap(),
        queue.rejected_count().await.unwrap(),
        queue.unacked_count().await.unwrap(),
    )
}

#[tokio::test]
async fn dead_connection_sweep_returns_unacked() {
    let store = Arc::new(MemoryStore::new());
    let cleaner_conn = Arc::new(open("cleaner", &store).await);
    let crashed = open("crashed", &store).await;
    let crashed_name = crashed.name().to_string();

    let queue = crashed.open_queue("jobs").await.unwrap();
    queue.publish_batch((1..=5).map(|i| format!("job-{}", i))).await.unwrap();
    for _ in 0..5 {
        queue.pull().await.unwrap().unwrap();
    }
    assert_eq!(totals(&queue).await, (0, 0, 5));

    // crash: no close, the heartbeat simply stops
    drop(crashed);
    tokio::time::sleep(PAST_TTL).await;

    let report = Cleaner::new(cleaner_conn.clone()).clean().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.returned_unacked, 5);

    assert_eq!(totals(&queue).await, (5, 0, 0));
    assert!(!cleaner_conn.list_all().await.unwrap().contains(&crashed_name));

    // the recovered work is consumable again, oldest first
    let survivor = cleaner_conn.open_queue("jobs").await.unwrap();
    let first = survivor.pull().await.unwrap().unwrap();
    assert_eq!(first.payload(), "job-1");
}

#[tokio::test]
async fn live_connection_is_never_touched() {
    let store = Arc::new(MemoryStore::new());
    let cleaner_conn = Arc::new(open("cleaner", &store).await);
    let live = open("live", &store).await;

    let queue = live.open_queue("jobs").await.unwrap();
    queue.publish_batch(["a", "b", "c"]).await.unwrap();
    queue.start_consuming(2, Duration::from_millis(10)).await.unwrap();
    let hoarder = Hoarder::default();
    let consumer = queue.add_consumer("hoarder", hoarder.clone()).await.unwrap();

    let held = hoarder.held.clone();
    eventually(|| {
        let held = held.clone();
        async move { held.lock().unwrap().len() == 3 }
    })
    .await;
    tokio::time::sleep(PAST_TTL).await;

    let report = Cleaner::new(cleaner_conn).clean().await.unwrap();
    assert_eq!(report.cleaned, 0);
    assert_eq!(report.skipped_alive, 2);

    assert_eq!(totals(&queue).await, (0, 0, 3));
    assert_eq!(queue.consumers().await.unwrap(), vec![consumer]);
    assert!(live.check().await.unwrap());

    queue.stop_consuming().await.unwrap();
}

#[tokio::test]
async fn no_loss_across_crash_and_recovery() {
    let store = Arc::new(MemoryStore::new());
    let cleaner_conn = Arc::new(open("cleaner", &store).await);
    let total = 40;

    let producer = open("producer", &store).await;
    let jobs = producer.open_queue("jobs").await.unwrap();
    jobs.publish_batch((0..total).map(|i| i.to_string())).await.unwrap();

    // a worker acks a few, grabs more and crashes
    let crashed = open("crashed", &store).await;
    let crashed_queue = crashed.open_queue("jobs").await.unwrap();
    let mut acked = 0;
    for _ in 0..5 {
        let mut delivery = crashed_queue.pull().await.unwrap().unwrap();
        assert!(delivery.ack().await.unwrap());
        acked += 1;
    }
    crashed_queue.start_consuming(7, Duration::from_millis(10)).await.unwrap();
    crashed_queue.add_consumer("hoarder", Hoarder::default()).await.unwrap();
    let unacked_key = rmq::keys::unacked(crashed.name(), "jobs");
    eventually(|| {
        let store = store.clone();
        let key = unacked_key.clone();
        async move { store.list_len(&key).await.unwrap() > 0 }
    })
    .await;
    // every handle goes away without stopping anything
    drop(crashed_queue);
    drop(crashed);
    tokio::time::sleep(PAST_TTL).await;

    // in-flight work is held by the dead connection, not lost
    let (ready, rejected, _) = totals(&jobs).await;
    let in_flight = store.list_len(&unacked_key).await.unwrap();
    assert_eq!(ready + rejected + in_flight + acked, total);
    assert!(in_flight > 0);

    Cleaner::new(cleaner_conn).clean().await.unwrap();

    // a healthy worker drains everything
    let worker = open("worker", &store).await;
    let worker_queue = worker.open_queue("jobs").await.unwrap();
    worker_queue.start_consuming(10, Duration::from_millis(10)).await.unwrap();
    let acker = Acker::default();
    worker_queue.add_consumer("acker", acker.clone()).await.unwrap();

    let counter = acker.acked.clone();
    eventually(|| {
        let counter = counter.clone();
        async move { counter.load(Ordering::SeqCst) == total - acked }
    })
    .await;

    worker.shutdown().await.unwrap();
    assert_eq!(totals(&jobs).await, (0, 0, 0));
}

#[tokio::test]
async fn ack_after_recovery_is_benign() {
    let store = Arc::new(MemoryStore::new());
    let cleaner_conn = Arc::new(open("cleaner", &store).await);
    let slow = open("slow", &store).await;

    let queue = slow.open_queue("jobs").await.unwrap();
    queue.publish("late").await.unwrap();
    let mut delivery = queue.pull().await.unwrap().unwrap();

    // a long pause: the heartbeat lapses and a cleaner steps in
    slow.stop_heartbeat().await;
    tokio::time::sleep(PAST_TTL).await;
    Cleaner::new(cleaner_conn).clean().await.unwrap();

    assert!(!delivery.ack().await.unwrap());
    assert_eq!(delivery.state(), DeliveryState::Unacked);
    assert!(!delivery.reject().await.unwrap());
    assert_eq!(totals(&queue).await, (1, 0, 0));
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let connection = open("worker", &store).await;
    let queue = connection.open_queue("jobs").await.unwrap();
    queue.publish_batch(["a", "b"]).await.unwrap();
    queue.pull().await.unwrap().unwrap();

    assert_eq!(queue.return_all_unacked().await.unwrap(), 1);
    let before = totals(&queue).await;
    assert_eq!(queue.return_all_unacked().await.unwrap(), 0);
    assert_eq!(totals(&queue).await, before);
}

#[tokio::test]
async fn concurrent_cleaners_recover_once() {
    let store = Arc::new(MemoryStore::new());
    let first = Arc::new(open("cleaner-a", &store).await);
    let second = Arc::new(open("cleaner-b", &store).await);

    for tag in ["dead-1", "dead-2", "dead-3"] {
        let dead = open(tag, &store).await;
        let queue = dead.open_queue("jobs").await.unwrap();
        queue.publish_batch(["x", "y"]).await.unwrap();
        queue.pull().await.unwrap().unwrap();
        queue.pull().await.unwrap().unwrap();
    }
    tokio::time::sleep(PAST_TTL).await;

    let a = Cleaner::new(first.clone());
    let b = Cleaner::new(second);
    let (report_a, report_b) = tokio::join!(a.clean(), b.clean());
    let (report_a, report_b) = (report_a.unwrap(), report_b.unwrap());

    assert_eq!(report_a.returned_unacked + report_b.returned_unacked, 6);
    assert_eq!(report_a.cleaned + report_b.cleaned, 3);

    let jobs = first.open_queue("jobs").await.unwrap();
    assert_eq!(jobs.ready_count().await.unwrap(), 6);
    assert_eq!(first.list_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn closed_connection_strands_nothing() {
    let store = Arc::new(MemoryStore::new());
    let cleaner_conn = Arc::new(open("cleaner", &store).await);
    let worker = open("worker", &store).await;
    let worker_name = worker.name().to_string();

    let queue = worker.open_queue("jobs").await.unwrap();
    queue.start_consuming(3, Duration::from_millis(10)).await.unwrap();
    assert!(worker.close().await.unwrap());

    // published after close: no fetcher may pick these up
    queue.publish_batch(["a", "b", "c"]).await.unwrap();
    tokio::time::sleep(PAST_TTL).await;
    drop(queue);
    drop(worker);

    let report = Cleaner::new(cleaner_conn.clone()).clean().await.unwrap();
    assert_eq!(report.cleaned, 0);

    let jobs = cleaner_conn.open_queue("jobs").await.unwrap();
    assert_eq!(totals(&jobs).await, (3, 0, 0));
    let stranded = rmq::keys::unacked(&worker_name, "jobs");
    assert_eq!(store.list_len(&stranded).await.unwrap(), 0);
}

#[tokio::test]
async fn cleaned_live_connection_comes_back() {
    let store = Arc::new(MemoryStore::new());
    let cleaner_conn = Arc::new(open("cleaner", &store).await);
    let live = open("live", &store).await;
    let live_name = live.name().to_string();

    let queue = live.open_queue("jobs").await.unwrap();
    queue.start_consuming(5, Duration::from_millis(10)).await.unwrap();
    let hoarder = Hoarder::default();
    queue.add_consumer("hoarder", hoarder.clone()).await.unwrap();

    // a cleaner wrongly takes the live connection for dead
    let ghost = cleaner_conn.hijack(&live_name);
    assert_eq!(Cleaner::clean_connection(&ghost).await.unwrap(), 0);
    assert!(!cleaner_conn.list_all().await.unwrap().contains(&live_name));
    assert!(live.consuming_queues().await.unwrap().is_empty());

    // the next heartbeat registers it again
    let registry = cleaner_conn.clone();
    let name = live_name.clone();
    eventually(|| {
        let connection = registry.clone();
        let name = name.clone();
        async move { connection.list_all().await.unwrap().contains(&name) }
    })
    .await;
    assert!(live.check().await.unwrap());

    // new work is fetched and the queue tracked again
    queue.publish_batch(["a", "b", "c"]).await.unwrap();
    let held = hoarder.held.clone();
    eventually(|| {
        let held = held.clone();
        async move { held.lock().unwrap().len() == 3 }
    })
    .await;
    let ghost = cleaner_conn.hijack(&live_name);
    let ghost = &ghost;
    eventually(|| async move {
        ghost.consuming_queues().await.unwrap() == vec!["jobs".to_string()]
    })
    .await;

    // a real crash now is recovered as usual
    drop(queue);
    drop(live);
    tokio::time::sleep(PAST_TTL).await;

    let report = Cleaner::new(cleaner_conn.clone()).clean().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.returned_unacked, 3);
    let jobs = cleaner_conn.open_queue("jobs").await.unwrap();
    assert_eq!(totals(&jobs).await, (3, 0, 0));
}

#[tokio::test]
async fn single_consumer_sees_fifo() {
    let store = Arc::new(MemoryStore::new());
    let connection = open("worker", &store).await;
    let queue = connection.open_queue("jobs").await.unwrap();
    queue.publish("p1").await.unwrap();
    queue.publish("p2").await.unwrap();
    queue.publish("p3").await.unwrap();

    queue.start_consuming(1, Duration::from_millis(10)).await.unwrap();
    let hoarder = Hoarder::default();
    queue.add_consumer("fifo", hoarder.clone()).await.unwrap();

    let held = hoarder.held.clone();
    eventually(|| {
        let held = held.clone();
        async move { held.lock().unwrap().len() == 3 }
    })
    .await;
    let order: Vec<String> = hoarder
        .held
        .lock()
        .unwrap()
        .iter()
        .map(|d| d.payload().to_string())
        .collect();
    assert_eq!(order, vec!["p1", "p2", "p3"]);
    queue.stop_consuming().await.unwrap();
}

#[tokio::test]
async fn batch_consumer_drains_queue() {
    let store = Arc::new(MemoryStore::new());
    let connection = open("worker", &store).await;
    let queue = connection.open_queue("jobs").await.unwrap();
    queue.publish_batch((0..23).map(|i| i.to_string())).await.unwrap();

    queue.start_consuming(10, Duration::from_millis(10)).await.unwrap();
    let acker = BatchAcker::default();
    queue
        .add_batch_consumer("batch", 5, Duration::from_millis(30), acker.clone())
        .await
        .unwrap();

    let counter = acker.acked.clone();
    eventually(|| {
        let counter = counter.clone();
        async move { counter.load(Ordering::SeqCst) == 23 }
    })
    .await;
    connection.shutdown().await.unwrap();
    assert_eq!(totals(&queue).await, (0, 0, 0));
}

#[tokio::test]
async fn batch_ack_reports_partial_failure() {
    let store = Arc::new(MemoryStore::new());
    let connection = open("worker", &store).await;
    let queue = connection.open_queue("jobs").await.unwrap();
    queue.publish_batch(["d1", "d2", "d3"]).await.unwrap();

    let mut deliveries = Vec::new();
    while let Some(delivery) = queue.pull().await.unwrap() {
        deliveries.push(delivery);
    }
    assert!(deliveries[0].ack().await.unwrap());

    let mut batch = Deliveries::new(deliveries);
    assert_eq!(batch.ack().await, 1);
    assert!(batch.iter().all(|d| d.state() == DeliveryState::Acked));
    assert_eq!(totals(&queue).await, (0, 0, 0));
}

#[tokio::test]
async fn rejected_round_trip_and_push_queue() {
    let store = Arc::new(MemoryStore::new());
    let connection = open("worker", &store).await;
    let jobs = connection.open_queue("jobs").await.unwrap();
    let retries = connection.open_queue("jobs-retry").await.unwrap();
    jobs.set_push_queue(&retries);
    jobs.publish_batch(["bad", "retry"]).await.unwrap();

    let mut bad = jobs.pull().await.unwrap().unwrap();
    assert!(bad.reject().await.unwrap());
    let mut retry = jobs.pull().await.unwrap().unwrap();
    assert!(retry.push().await.unwrap());
    assert_eq!(retry.state(), DeliveryState::Pushed);

    assert_eq!(totals(&jobs).await, (0, 1, 0));
    assert_eq!(retries.ready_count().await.unwrap(), 1);

    assert_eq!(jobs.return_all_rejected().await.unwrap(), 1);
    assert_eq!(totals(&jobs).await, (1, 0, 0));
    assert_eq!(jobs.pull().await.unwrap().unwrap().payload(), "bad");
}
