//! Background tasks behind [`Queue::start_consuming`](super::Queue::start_consuming).
//!
//! One fetcher task per consuming queue moves payloads from ready to the
//! connection's unacked list, never more than the prefetch buffer can hold.
//! Consumer tasks share the buffer and hand deliveries to user callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::consumer::{BatchConsumer, Consumer};
use crate::delivery::{Deliveries, Delivery};
use crate::storage::{End, Store};

/// Upper bound for the idle poll backoff.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(1);

/// Simple exponential backoff helper for idle polls
pub(super) struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub(super) fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base,
            base,
            max: max.max(base),
        }
    }

    pub(super) fn reset(&mut self) {
        self.current = self.base;
    }

    pub(super) fn next(&mut self) -> Duration {
        let next = self.current;
        self.current = self.current.mul_f32(2.0).min(self.max);
        next
    }
}

/// Everything the fetcher needs to build deliveries, cloned out of the queue.
pub(super) struct Fetcher {
    pub(super) queue: String,
    pub(super) store: Arc<dyn Store>,
    pub(super) ready_key: String,
    pub(super) unacked_key: String,
    pub(super) rejected_key: String,
    pub(super) connection_queues_key: String,
    pub(super) push_key: Arc<RwLock<Option<String>>>,
    pub(super) connection_closed: Arc<AtomicBool>,
}

impl Fetcher {
    fn stopping(&self, shutdown_rx: &watch::Receiver<bool>) -> bool {
        *shutdown_rx.borrow() || self.connection_closed.load(Ordering::SeqCst)
    }

    fn delivery(&self, payload: String) -> Delivery {
        let push_key = self.push_key.read().ok().and_then(|key| key.clone());
        Delivery::new(
            payload,
            self.unacked_key.clone(),
            self.rejected_key.clone(),
            push_key,
            self.store.clone(),
        )
    }

    async fn run(
        self,
        sender: mpsc::Sender<Delivery>,
        poll_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(queue = %self.queue, "fetcher started");
        let mut backoff = Backoff::new(poll_interval, MAX_POLL_BACKOFF);

        'outer: loop {
            if self.stopping(&shutdown_rx) {
                break;
            }

            let mut fetched = 0usize;
            loop {
                // Reserve buffer space before taking a payload out of ready.
                let permit = match sender.try_reserve() {
                    Ok(permit) => permit,
                    Err(mpsc::error::TrySendError::Full(())) => break,
                    Err(mpsc::error::TrySendError::Closed(())) => break 'outer,
                };
                match self
                    .store
                    .list_move(&self.ready_key, &self.unacked_key, End::Right, End::Left)
                    .await
                {
                    Ok(Some(payload)) => {
                        permit.send(self.delivery(payload));
                        fetched += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(queue = %self.queue, error = %e, "failed to fetch deliveries");
                        break;
                    }
                }
                if self.stopping(&shutdown_rx) {
                    break 'outer;
                }
            }

            if fetched > 0 {
                debug!(queue = %self.queue, fetched, "deliveries fetched");
                // a cleaner may have closed the queue in this connection
                if self.connection_closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = self
                    .store
                    .set_add(&self.connection_queues_key, &self.queue)
                    .await
                {
                    warn!(queue = %self.queue, error = %e, "failed to register consuming queue");
                }
                backoff.reset();
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff.next()) => {},
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!(queue = %self.queue, "fetcher stopped");
    }
}

/// A consumer callback, normalized to batches.
#[derive(Clone)]
pub(super) enum Handler {
    Single(Arc<dyn Consumer>),
    Batch {
        consumer: Arc<dyn BatchConsumer>,
        size: usize,
        timeout: Duration,
    },
}

impl Handler {
    fn batch_size(&self) -> usize {
        match self {
            Handler::Single(_) => 1,
            Handler::Batch { size, .. } => *size,
        }
    }

    fn batch_timeout(&self) -> Duration {
        match self {
            Handler::Single(_) => Duration::ZERO,
            Handler::Batch { timeout, .. } => *timeout,
        }
    }

    async fn consume(&self, batch: Deliveries) {
        match self {
            Handler::Single(consumer) => {
                for delivery in batch {
                    consumer.consume(delivery).await;
                }
            }
            Handler::Batch { consumer, .. } => consumer.consume(batch).await,
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Delivery>>>;

async fn run_consumer(
    name: String,
    receiver: SharedReceiver,
    handler: Handler,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(consumer = %name, "consumer started");
    let size = handler.batch_size();
    let timeout = handler.batch_timeout();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let batch = {
            let mut rx = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                rx = receiver.lock() => rx,
            };
            let first = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let mut batch = Deliveries::default();
            batch.push_delivery(first);
            let deadline = Instant::now() + timeout;
            // a partial batch is still handed over on shutdown
            while batch.len() < size {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    received = tokio::time::timeout_at(deadline, rx.recv()) => match received {
                        Ok(Some(delivery)) => batch.push_delivery(delivery),
                        _ => break,
                    },
                }
            }
            batch
        };

        debug!(consumer = %name, size = batch.len(), "consuming batch");
        handler.consume(batch).await;
    }
    debug!(consumer = %name, "consumer stopped");
}

struct ConsumerTask {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerTask {
    async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "consumer task ended abnormally");
            }
        }
    }
}

impl Drop for ConsumerTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Running consume machinery of one queue handle.
///
/// Dropping it without [`ConsumeState::stop`] aborts every task and leaves
/// fetched deliveries in the unacked list, exactly as a crash would.
pub(super) struct ConsumeState {
    shutdown_tx: watch::Sender<bool>,
    fetcher: Option<JoinHandle<()>>,
    receiver: SharedReceiver,
    consumers: HashMap<String, ConsumerTask>,
}

impl ConsumeState {
    pub(super) fn start(fetcher: Fetcher, prefetch_limit: usize, poll_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(prefetch_limit);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(fetcher.run(sender, poll_interval, shutdown_rx));
        Self {
            shutdown_tx,
            fetcher: Some(handle),
            receiver: Arc::new(Mutex::new(receiver)),
            consumers: HashMap::new(),
        }
    }

    pub(super) fn spawn_consumer(&mut self, name: String, handler: Handler) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_consumer(
            name.clone(),
            self.receiver.clone(),
            handler,
            shutdown_rx,
        ));
        self.consumers.insert(
            name,
            ConsumerTask {
                shutdown_tx,
                handle: Some(handle),
            },
        );
    }

    pub(super) fn take_consumer(&mut self, name: &str) -> Option<ConsumerTaskHandle> {
        self.consumers.remove(name).map(ConsumerTaskHandle)
    }

    pub(super) fn take_consumers(&mut self) -> Vec<ConsumerTaskHandle> {
        self.consumers
            .drain()
            .map(|(_, task)| ConsumerTaskHandle(task))
            .collect()
    }

    /// Stop the fetcher and all consumers, waiting for in-progress callbacks,
    /// and hand back the deliveries that were buffered but never consumed.
    pub(super) async fn stop(mut self) -> Vec<Delivery> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.fetcher.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "fetcher task ended abnormally");
            }
        }
        for task in self.take_consumers() {
            task.stop().await;
        }

        let mut buffered = Vec::new();
        let mut rx = self.receiver.lock().await;
        rx.close();
        while let Ok(delivery) = rx.try_recv() {
            buffered.push(delivery);
        }
        buffered
    }
}

impl Drop for ConsumeState {
    fn drop(&mut self) {
        if let Some(handle) = self.fetcher.take() {
            handle.abort();
        }
    }
}

/// A consumer task taken out of the state so it can be awaited without
/// holding the queue's lock.
pub(super) struct ConsumerTaskHandle(ConsumerTask);

impl ConsumerTaskHandle {
    pub(super) async fn stop(self) {
        self.0.stop().await;
    }
}
