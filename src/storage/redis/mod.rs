//! Redis implementation of the [`Store`] contract.
//!
//! Single-command primitives map directly onto Redis commands (`LPUSH`,
//! `LMOVE`, `LREM`, `SADD`, ...). The one compound primitive,
//! [`Store::list_remove_and_push`], runs as a Lua script so that a payload is
//! never observed in two lists or in none.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rmq::storage::RedisStore;
//! use rmq::{Connection, ConnectionConfig};
//!
//! let store = RedisStore::builder()
//!     .redis_url("redis://localhost:6379")
//!     .build()
//!     .await?;
//!
//! let connection = Connection::open("worker", Arc::new(store), ConnectionConfig::default()).await?;
//! ```
//!
//! # Valkey Compatibility
//!
//! Valkey and other Redis-compatible servers work as long as they support
//! `LMOVE` (Redis 6.2+) and `EVAL`.

use std::time::Duration;

use async_trait::async_trait;
use bb8_redis::bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use super::error::StorageError;
use super::traits::{End, Store};

const REMOVE_AND_PUSH_LUA: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call(ARGV[2], KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Redis-backed [`Store`] using a bb8 connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
}

impl RedisStore {
    /// Wrap an existing pool.
    pub fn new(pool: Pool<RedisConnectionManager>) -> Self {
        Self { pool }
    }

    pub fn builder() -> RedisStoreBuilder {
        RedisStoreBuilder::new()
    }

    /// Get the Redis connection pool.
    pub fn pool(&self) -> &Pool<RedisConnectionManager> {
        &self.pool
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to get redis connection: {}", e)))
    }

    /// Round trip to the server.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    /// Ping up to `attempts` times, doubling the pause between tries.
    async fn wait_until_reachable(&self, attempts: u32) -> Result<(), StorageError> {
        let mut pause = FIRST_RETRY_PAUSE;
        let mut attempt = 1;
        loop {
            match self.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "redis not reachable yet");
                    tokio::time::sleep(pause).await;
                    pause *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
const FIRST_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Builder for a [`RedisStore`].
///
/// Every connection, heartbeat and fetcher of a process shares the pool, so
/// `max_connections` bounds the concurrent store calls of the process.
pub struct RedisStoreBuilder {
    redis_url: String,
    max_connections: u32,
    connect_timeout: Duration,
    connect_attempts: u32,
}

impl RedisStoreBuilder {
    pub fn new() -> Self {
        Self {
            redis_url: DEFAULT_URL.to_string(),
            max_connections: 16,
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 3,
        }
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// How long a store call waits for a free pooled connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How often `build` pings the server before giving up.
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    /// Build the pool and make sure the server answers.
    pub async fn build(self) -> Result<RedisStore, StorageError> {
        if self.max_connections == 0 {
            return Err(StorageError::Configuration(
                "max_connections must be > 0".into(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(StorageError::Configuration(
                "connect_attempts must be > 0".into(),
            ));
        }
        let url = without_credentials(&self.redis_url);
        let manager = RedisConnectionManager::new(self.redis_url.as_str()).map_err(|e| {
            StorageError::Configuration(format!("invalid redis url {}: {}", url, e))
        })?;

        let pool = Pool::builder()
            .max_size(self.max_connections)
            .connection_timeout(self.connect_timeout)
            .build(manager)
            .await?;
        let store = RedisStore::new(pool);
        store.wait_until_reachable(self.connect_attempts).await?;

        info!(url = %url, max_connections = self.max_connections, "redis store ready");
        Ok(store)
    }
}

impl Default for RedisStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The URL with any user and password removed, for logs and errors.
fn without_credentials(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{}://{}", scheme, host),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

fn push_command(end: End) -> &'static str {
    match end {
        End::Left => "LPUSH",
        End::Right => "RPUSH",
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn list_push(
        &self,
        key: &str,
        end: End,
        values: &[String],
    ) -> Result<usize, StorageError> {
        let mut conn = self.conn().await?;
        if values.is_empty() {
            return Ok(conn.llen(key).await?);
        }
        let len: usize = redis::cmd(push_command(end))
            .arg(key)
            .arg(values)
            .query_async(&mut *conn)
            .await?;
        Ok(len)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StorageError> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn list_move(
        &self,
        source: &str,
        destination: &str,
        from: End,
        to: End,
    ) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn().await?;
        let moved: Option<String> = redis::cmd("LMOVE")
            .arg(source)
            .arg(destination)
            .arg(from.as_str())
            .arg(to.as_str())
            .query_async(&mut *conn)
            .await?;
        Ok(moved)
    }

    async fn list_remove(
        &self,
        key: &str,
        count: usize,
        value: &str,
    ) -> Result<usize, StorageError> {
        let mut conn = self.conn().await?;
        Ok(conn.lrem(key, count as isize, value).await?)
    }

    async fn list_remove_and_push(
        &self,
        source: &str,
        value: &str,
        destination: &str,
        to: End,
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        let moved: i64 = redis::cmd("EVAL")
            .arg(REMOVE_AND_PUSH_LUA)
            .arg(2)
            .arg(source)
            .arg(destination)
            .arg(value)
            .arg(push_command(to))
            .query_async(&mut *conn)
            .await?;
        Ok(moved == 1)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        let added: usize = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        let removed: usize = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn set_len(&self, key: &str) -> Result<usize, StorageError> {
        let mut conn = self.conn().await?;
        Ok(conn.scard(key).await?)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }
}
