//! Connections: registration of one live process in the shared store.
//!
//! A connection is alive as long as its heartbeat key exists. The owning
//! process refreshes it from a background task; a process that crashes simply
//! stops refreshing, and once the key expires any other connection's
//! [`Cleaner`](crate::Cleaner) may recover its in-flight work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::keys;
use crate::queue::{random_suffix, Queue};
use crate::storage::Store;

const HEARTBEAT_VALUE: &str = "1";

struct Heartbeat {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Handle on a registered connection.
///
/// Obtained with [`Connection::open`] for the current process, or with
/// [`Connection::hijack`] to act on behalf of another (possibly dead)
/// connection. Hijacked handles never touch the heartbeat.
pub struct Connection {
    name: String,
    store: Arc<dyn Store>,
    config: ConnectionConfig,
    hijacked: bool,
    closed: Arc<AtomicBool>,
    heartbeat: Mutex<Option<Heartbeat>>,
    queues: Mutex<Vec<Queue>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("hijacked", &self.hijacked)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connection {
    fn new(name: String, store: Arc<dyn Store>, config: ConnectionConfig, hijacked: bool) -> Self {
        Self {
            name,
            store,
            config,
            hijacked,
            closed: Arc::new(AtomicBool::new(false)),
            heartbeat: Mutex::new(None),
            queues: Mutex::new(Vec::new()),
        }
    }

    /// Open a connection named `<tag>-<random suffix>` and start its
    /// heartbeat.
    pub async fn open(tag: &str, store: Arc<dyn Store>, config: ConnectionConfig) -> Result<Self> {
        if !keys::is_valid_name(tag) {
            return Err(Error::InvalidName(tag.to_string()));
        }
        let name = format!("{}-{}", tag, random_suffix());
        Self::open_with_name(name, store, config).await
    }

    /// Open a connection with an exact name. Opening a name that is already
    /// registered is allowed and refreshes its heartbeat.
    pub async fn open_with_name(
        name: impl Into<String>,
        store: Arc<dyn Store>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let name = name.into();
        if !keys::is_valid_name(&name) {
            return Err(Error::InvalidName(name));
        }
        config.validate()?;

        let connection = Self::new(name, store, config, false);
        // Heartbeat first, so a cleaner never sees the new entry as dead.
        connection.refresh().await?;
        connection
            .store
            .set_add(keys::CONNECTIONS, &connection.name)
            .await?;
        connection.start_heartbeat();

        info!(
            connection = %connection.name,
            heartbeat_ttl_ms = config.heartbeat_ttl.as_millis() as u64,
            "connection opened"
        );
        Ok(connection)
    }

    /// A handle acting as `name`, without a heartbeat of its own.
    pub fn hijack(&self, name: &str) -> Connection {
        Self::new(name.to_string(), self.store.clone(), self.config, true)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Extend the heartbeat expiry. Hijacked handles refuse and return false.
    pub async fn refresh(&self) -> Result<bool> {
        if self.hijacked {
            warn!(connection = %self.name, "refusing to refresh heartbeat of hijacked connection");
            return Ok(false);
        }
        self.store
            .set_with_expiry(
                &keys::heartbeat(&self.name),
                HEARTBEAT_VALUE,
                self.config.heartbeat_ttl,
            )
            .await?;
        Ok(true)
    }

    fn start_heartbeat(&self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(heartbeat_loop(
            self.name.clone(),
            self.store.clone(),
            self.config,
            shutdown_rx,
        ));
        let previous = lock(&self.heartbeat).replace(Heartbeat {
            shutdown_tx,
            handle,
        });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Stop refreshing the heartbeat without deregistering. The connection
    /// is considered dead once the TTL runs out. Returns false if no
    /// heartbeat was running.
    pub async fn stop_heartbeat(&self) -> bool {
        let heartbeat = lock(&self.heartbeat).take();
        let Some(heartbeat) = heartbeat else {
            return false;
        };
        let _ = heartbeat.shutdown_tx.send(true);
        if let Err(e) = heartbeat.handle.await {
            warn!(connection = %self.name, error = %e, "heartbeat task ended abnormally");
        }
        debug!(connection = %self.name, "heartbeat stopped");
        true
    }

    /// True if the heartbeat has not expired.
    pub async fn check(&self) -> Result<bool> {
        Ok(self.store.exists(&keys::heartbeat(&self.name)).await?)
    }

    /// Every registered connection name, alive or not.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        Ok(self.store.set_members(keys::CONNECTIONS).await?)
    }

    /// Queues this connection consumes (or consumed, if it is dead).
    pub async fn consuming_queues(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .set_members(&keys::connection_queues(&self.name))
            .await?)
    }

    /// Every queue name ever opened by any connection.
    pub async fn open_queues(&self) -> Result<Vec<String>> {
        Ok(self.store.set_members(keys::QUEUES).await?)
    }

    /// Open a queue on behalf of this connection, registering its name.
    pub async fn open_queue(&self, name: &str) -> Result<Queue> {
        if !keys::is_valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        self.store
            .set_add(keys::QUEUES, name)
            .await
            .map_err(|source| Error::QueueOpen {
                queue: name.to_string(),
                source,
            })?;
        // handles of the same queue share their consume state
        let mut queues = lock(&self.queues);
        if let Some(existing) = queues.iter().find(|queue| queue.name() == name) {
            return Ok(existing.clone());
        }
        let queue = self.queue_handle(name);
        queues.push(queue.clone());
        debug!(connection = %self.name, queue = name, "queue opened");
        Ok(queue)
    }

    /// Queue handle for read-only use; does not register anything.
    pub(crate) fn queue_handle(&self, name: &str) -> Queue {
        Queue::handle(name, &self.name, self.store.clone(), self.closed.clone())
    }

    /// Stop consuming on every queue opened through this handle. Returns how
    /// many buffered deliveries were returned to ready.
    pub async fn stop_all_consuming(&self) -> Result<usize> {
        let queues: Vec<Queue> = lock(&self.queues)
            .iter()
            .filter(|queue| queue.is_consuming())
            .cloned()
            .collect();

        let mut returned = 0;
        let mut first_error = None;
        for queue in queues {
            match queue.stop_consuming().await {
                Ok(count) => returned += count,
                // a concurrent stop is fine
                Err(Error::NotConsuming(_)) => {}
                Err(e) => {
                    warn!(connection = %self.name, queue = queue.name(), error = %e, "failed to stop consuming");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(returned),
        }
    }

    /// Return the unacked deliveries of every consuming queue to ready and
    /// close the queues in this connection.
    ///
    /// Keeps going after a failing queue so the others are not stranded,
    /// then reports the first failure. Returns the number of deliveries
    /// returned.
    pub async fn close_all_queues_in_connection(&self) -> Result<usize> {
        let queue_names = self.consuming_queues().await?;

        let mut returned = 0;
        let mut first_error = None;
        for queue_name in queue_names {
            match self.close_queue(&queue_name).await {
                Ok(count) => returned += count,
                Err(e) => {
                    warn!(connection = %self.name, queue = %queue_name, error = %e, "failed to close queue");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(returned),
        }
    }

    async fn close_queue(&self, queue_name: &str) -> Result<usize> {
        let queue = self.queue_handle(queue_name);
        let returned = queue.return_all_unacked().await.map_err(|e| match e {
            Error::Storage(source) => Error::QueueClose {
                queue: queue_name.to_string(),
                connection: self.name.clone(),
                source,
            },
            other => other,
        })?;
        queue.close_in_connection().await?;
        Ok(returned)
    }

    /// Stop consuming on every queue of this handle and remove the
    /// connection from the registry.
    ///
    /// Buffered deliveries go back to ready first. If that fails the
    /// connection stays registered with its heartbeat stopped, so a cleaner
    /// recovers it once the TTL runs out. Returns false if it was not
    /// registered anymore, e.g. because a cleaner or another handle closed
    /// it first.
    pub async fn close(&self) -> Result<bool> {
        // queues of this handle refuse to fetch from here on
        self.closed.store(true, Ordering::SeqCst);
        self.stop_heartbeat().await;
        self.stop_all_consuming().await?;

        let close_error = |source| Error::ConnectionClose {
            connection: self.name.clone(),
            source,
        };
        let removed = self
            .store
            .set_remove(keys::CONNECTIONS, &self.name)
            .await
            .map_err(close_error)?;
        self.store
            .delete(&keys::heartbeat(&self.name))
            .await
            .map_err(close_error)?;

        if removed {
            info!(connection = %self.name, hijacked = self.hijacked, "connection closed");
        } else {
            warn!(connection = %self.name, "connection was already closed");
        }
        Ok(removed)
    }

    /// Graceful shutdown: stop consuming, return in-flight deliveries to
    /// ready, close all queues and deregister.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_all_consuming().await?;
        self.close_all_queues_in_connection().await?;
        if !self.close().await? {
            return Err(Error::ConnectionAlreadyClosed(self.name.clone()));
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let heartbeat = self
            .heartbeat
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.handle.abort();
        }
    }
}

async fn heartbeat_loop(
    name: String,
    store: Arc<dyn Store>,
    config: ConnectionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let key = keys::heartbeat(&name);
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }

        if let Err(e) = store
            .set_with_expiry(&key, HEARTBEAT_VALUE, config.heartbeat_ttl)
            .await
        {
            warn!(connection = %name, error = %e, "failed to refresh heartbeat");
            continue;
        }
        // A cleaner may have deregistered us while we were slow to refresh.
        match store.set_add(keys::CONNECTIONS, &name).await {
            Ok(true) => warn!(connection = %name, "connection was cleaned while alive, registered again"),
            Ok(false) => {}
            Err(e) => warn!(connection = %name, error = %e, "failed to confirm registration"),
        }
    }
}
