//! Queues.
//!
//! A queue is a ready list, a rejected list and, for every connection that
//! consumes it, an unacked list and a consumer set. Payloads are published
//! onto the head of ready and consumed from its tail, so a single consumer
//! sees them in publish order.
//!
//! ```rust,ignore
//! let queue = connection.open_queue("emails").await?;
//! queue.publish("hello").await?;
//!
//! queue.start_consuming(10, Duration::from_millis(100)).await?;
//! queue.add_consumer("mailer", MyConsumer).await?;
//! ```

mod consume;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consumer::{BatchConsumer, Consumer};
use crate::delivery::Delivery;
use crate::error::{Error, Result};
use crate::keys;
use crate::storage::{End, Store};

use consume::{ConsumeState, Fetcher, Handler};

/// Handle on a named queue, acting on behalf of one connection.
///
/// Cloning is cheap and clones share the consume state.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    connection_name: String,
    store: Arc<dyn Store>,
    ready_key: String,
    rejected_key: String,
    unacked_key: String,
    consumers_key: String,
    connection_queues_key: String,
    push_key: Arc<RwLock<Option<String>>>,
    connection_closed: Arc<AtomicBool>,
    consuming: Mutex<Option<ConsumeState>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("connection", &self.inner.connection_name)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Build a handle without touching the store. `connection_closed` is set
    /// once the owning connection handle is closed.
    pub(crate) fn handle(
        name: &str,
        connection_name: &str,
        store: Arc<dyn Store>,
        connection_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                connection_name: connection_name.to_string(),
                store,
                ready_key: keys::ready(name),
                rejected_key: keys::rejected(name),
                unacked_key: keys::unacked(connection_name, name),
                consumers_key: keys::consumers(connection_name, name),
                connection_queues_key: keys::connection_queues(connection_name),
                push_key: Arc::new(RwLock::new(None)),
                connection_closed,
                consuming: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Name of the connection this handle acts for.
    pub fn connection_name(&self) -> &str {
        &self.inner.connection_name
    }

    fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    fn consuming(&self) -> MutexGuard<'_, Option<ConsumeState>> {
        // The state holds no invariants a panicking holder could break.
        self.inner
            .consuming
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a payload to the ready list.
    pub async fn publish(&self, payload: impl Into<String>) -> Result<()> {
        self.publish_batch([payload]).await
    }

    /// Append payloads to the ready list, in order, in one store call.
    pub async fn publish_batch<I, P>(&self, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let payloads: Vec<String> = payloads.into_iter().map(Into::into).collect();
        if payloads.is_empty() {
            return Ok(());
        }
        let count = payloads.len();
        self.store()
            .list_push(&self.inner.ready_key, End::Left, &payloads)
            .await?;
        debug!(queue = %self.inner.name, count, "published");
        Ok(())
    }

    /// Deliveries pushed from this queue go to the ready list of `push_queue`.
    pub fn set_push_queue(&self, push_queue: &Queue) {
        let mut push_key = self
            .inner
            .push_key
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *push_key = Some(push_queue.inner.ready_key.clone());
    }

    fn ensure_connection_open(&self) -> Result<()> {
        if self.inner.connection_closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionAlreadyClosed(
                self.inner.connection_name.clone(),
            ));
        }
        Ok(())
    }

    async fn register_consuming(&self) -> Result<()> {
        self.ensure_connection_open()?;
        self.store()
            .set_add(&self.inner.connection_queues_key, &self.inner.name)
            .await?;
        Ok(())
    }

    fn delivery(&self, payload: String) -> Delivery {
        let push_key = self
            .inner
            .push_key
            .read()
            .ok()
            .and_then(|key| key.clone());
        Delivery::new(
            payload,
            self.inner.unacked_key.clone(),
            self.inner.rejected_key.clone(),
            push_key,
            self.inner.store.clone(),
        )
    }

    /// Take one payload from ready into this connection's unacked list.
    ///
    /// Pull-style alternative to [`Queue::start_consuming`]. Returns `None`
    /// when ready is empty.
    pub async fn pull(&self) -> Result<Option<Delivery>> {
        self.register_consuming().await?;
        let payload = self
            .store()
            .list_move(
                &self.inner.ready_key,
                &self.inner.unacked_key,
                End::Right,
                End::Left,
            )
            .await?;
        Ok(payload.map(|payload| self.delivery(payload)))
    }

    /// Start moving payloads from ready into a prefetch buffer of
    /// `prefetch_limit` deliveries, polling every `poll_interval` (with
    /// backoff) while ready is empty.
    ///
    /// Consumers added with [`Queue::add_consumer`] or
    /// [`Queue::add_batch_consumer`] drain the buffer.
    pub async fn start_consuming(&self, prefetch_limit: usize, poll_interval: Duration) -> Result<()> {
        if prefetch_limit == 0 {
            return Err(Error::Configuration("prefetch_limit must be > 0".into()));
        }
        if poll_interval.is_zero() {
            return Err(Error::Configuration("poll_interval must be > 0".into()));
        }
        if self.consuming().is_some() {
            return Err(Error::AlreadyConsuming(self.inner.name.clone()));
        }

        self.register_consuming().await?;

        let fetcher = Fetcher {
            queue: self.inner.name.clone(),
            store: self.inner.store.clone(),
            ready_key: self.inner.ready_key.clone(),
            unacked_key: self.inner.unacked_key.clone(),
            rejected_key: self.inner.rejected_key.clone(),
            connection_queues_key: self.inner.connection_queues_key.clone(),
            push_key: self.inner.push_key.clone(),
            connection_closed: self.inner.connection_closed.clone(),
        };

        let mut consuming = self.consuming();
        if consuming.is_some() {
            return Err(Error::AlreadyConsuming(self.inner.name.clone()));
        }
        *consuming = Some(ConsumeState::start(fetcher, prefetch_limit, poll_interval));
        info!(
            queue = %self.inner.name,
            connection = %self.inner.connection_name,
            prefetch_limit,
            "started consuming"
        );
        Ok(())
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming().is_some()
    }

    /// Stop fetching and all consumers of this handle.
    ///
    /// Waits for in-progress consumer callbacks, removes the consumers from
    /// the store and returns deliveries that were fetched but never handed
    /// to a consumer back to ready. Returns how many were returned.
    pub async fn stop_consuming(&self) -> Result<usize> {
        let state = self.consuming().take();
        let Some(state) = state else {
            return Err(Error::NotConsuming(self.inner.name.clone()));
        };
        let buffered = state.stop().await;
        self.store().delete(&self.inner.consumers_key).await?;

        let mut returned = 0;
        for delivery in buffered {
            let moved = self
                .store()
                .list_remove_and_push(
                    &self.inner.unacked_key,
                    delivery.payload(),
                    &self.inner.ready_key,
                    End::Right,
                )
                .await?;
            if moved {
                returned += 1;
            }
        }
        info!(queue = %self.inner.name, returned, "stopped consuming");
        Ok(returned)
    }

    async fn register_consumer(&self, tag: &str, handler: Handler) -> Result<String> {
        if !keys::is_valid_name(tag) {
            return Err(Error::InvalidName(tag.to_string()));
        }
        if !self.is_consuming() {
            return Err(Error::NotConsuming(self.inner.name.clone()));
        }
        let name = format!("{}-{}", tag, random_suffix());
        self.store()
            .set_add(&self.inner.consumers_key, &name)
            .await?;

        // stop_consuming may have run while the name was being registered
        let spawned = match self.consuming().as_mut() {
            Some(state) => {
                state.spawn_consumer(name.clone(), handler);
                true
            }
            None => false,
        };
        if !spawned {
            self.store()
                .set_remove(&self.inner.consumers_key, &name)
                .await?;
            return Err(Error::NotConsuming(self.inner.name.clone()));
        }
        debug!(queue = %self.inner.name, consumer = %name, "consumer added");
        Ok(name)
    }

    /// Add a consumer handling one delivery at a time. Returns its name.
    pub async fn add_consumer<C: Consumer>(&self, tag: &str, consumer: C) -> Result<String> {
        self.register_consumer(tag, Handler::Single(Arc::new(consumer)))
            .await
    }

    /// Add a consumer receiving batches of up to `batch_size` deliveries. A
    /// partial batch is handed over once `batch_timeout` has passed since its
    /// first delivery.
    pub async fn add_batch_consumer<C: BatchConsumer>(
        &self,
        tag: &str,
        batch_size: usize,
        batch_timeout: Duration,
        consumer: C,
    ) -> Result<String> {
        if batch_size == 0 {
            return Err(Error::Configuration("batch_size must be > 0".into()));
        }
        let handler = Handler::Batch {
            consumer: Arc::new(consumer),
            size: batch_size,
            timeout: batch_timeout,
        };
        self.register_consumer(tag, handler).await
    }

    /// Stop and unregister one consumer. Returns false if it was not
    /// registered.
    pub async fn remove_consumer(&self, name: &str) -> Result<bool> {
        let task = self.consuming().as_mut().and_then(|state| state.take_consumer(name));
        if let Some(task) = task {
            task.stop().await;
        }
        Ok(self
            .store()
            .set_remove(&self.inner.consumers_key, name)
            .await?)
    }

    /// Stop and unregister every consumer of this handle. Returns how many
    /// were registered in the store.
    pub async fn remove_all_consumers(&self) -> Result<usize> {
        let tasks = self
            .consuming()
            .as_mut()
            .map(|state| state.take_consumers())
            .unwrap_or_default();
        for task in tasks {
            task.stop().await;
        }
        let count = self.store().set_len(&self.inner.consumers_key).await?;
        self.store().delete(&self.inner.consumers_key).await?;
        Ok(count)
    }

    /// Consumers this connection runs on the queue.
    pub async fn consumers(&self) -> Result<Vec<String>> {
        Ok(self.store().set_members(&self.inner.consumers_key).await?)
    }

    pub async fn consumer_count(&self) -> Result<usize> {
        Ok(self.store().set_len(&self.inner.consumers_key).await?)
    }

    pub async fn ready_count(&self) -> Result<usize> {
        Ok(self.store().list_len(&self.inner.ready_key).await?)
    }

    pub async fn rejected_count(&self) -> Result<usize> {
        Ok(self.store().list_len(&self.inner.rejected_key).await?)
    }

    /// In-flight deliveries of this handle's connection.
    pub async fn unacked_count(&self) -> Result<usize> {
        Ok(self.store().list_len(&self.inner.unacked_key).await?)
    }

    /// Move every unacked delivery of this connection back to ready.
    ///
    /// Each move is atomic and the oldest unacked payload ends up next in
    /// line. An empty unacked list returns 0.
    pub async fn return_all_unacked(&self) -> Result<usize> {
        let mut returned = 0;
        while self
            .store()
            .list_move(
                &self.inner.unacked_key,
                &self.inner.ready_key,
                End::Left,
                End::Right,
            )
            .await?
            .is_some()
        {
            returned += 1;
        }
        if returned > 0 {
            info!(
                queue = %self.inner.name,
                connection = %self.inner.connection_name,
                returned,
                "returned unacked deliveries"
            );
        }
        Ok(returned)
    }

    /// Move up to `count` rejected payloads back to ready, oldest first.
    pub async fn return_rejected(&self, count: usize) -> Result<usize> {
        let mut returned = 0;
        while returned < count {
            let moved = self
                .store()
                .list_move(
                    &self.inner.rejected_key,
                    &self.inner.ready_key,
                    End::Right,
                    End::Left,
                )
                .await?;
            if moved.is_none() {
                break;
            }
            returned += 1;
        }
        debug!(queue = %self.inner.name, returned, "returned rejected deliveries");
        Ok(returned)
    }

    pub async fn return_all_rejected(&self) -> Result<usize> {
        let count = self.rejected_count().await?;
        self.return_rejected(count).await
    }

    /// Drop every ready payload. Returns false if ready was already empty.
    pub async fn purge_ready(&self) -> Result<bool> {
        Ok(self.store().delete(&self.inner.ready_key).await?)
    }

    /// Drop every rejected payload. Returns false if it was already empty.
    pub async fn purge_rejected(&self) -> Result<bool> {
        Ok(self.store().delete(&self.inner.rejected_key).await?)
    }

    /// Remove this connection's consumers of the queue and drop the queue
    /// from the connection's consuming set.
    ///
    /// The unacked list is left alone; drain it with
    /// [`Queue::return_all_unacked`] first.
    pub async fn close_in_connection(&self) -> Result<()> {
        let close_error = |source| Error::QueueClose {
            queue: self.inner.name.clone(),
            connection: self.inner.connection_name.clone(),
            source,
        };
        self.store()
            .delete(&self.inner.consumers_key)
            .await
            .map_err(close_error)?;
        let removed = self
            .store()
            .set_remove(&self.inner.connection_queues_key, &self.inner.name)
            .await
            .map_err(close_error)?;
        if !removed {
            warn!(
                queue = %self.inner.name,
                connection = %self.inner.connection_name,
                "queue was not consumed by connection"
            );
        }
        Ok(())
    }
}

/// Six lowercase alphanumerics, used to make consumer and connection names
/// unique.
pub(crate) fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}
