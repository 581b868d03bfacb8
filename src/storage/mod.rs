//! Store abstraction layer.
//!
//! The queue protocol only talks to the shared store through the [`Store`]
//! trait. Two implementations ship with the crate:
//!
//! - [`RedisStore`]: Redis or any Redis-compatible server (feature `redis`, default)
//! - [`MemoryStore`]: a single-process store for tests and embedding
//!
//! # Using a Custom Store
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rmq::storage::Store;
//! use rmq::{Connection, ConnectionConfig};
//!
//! let store: Arc<dyn Store> = Arc::new(MyStore::new());
//! let connection = Connection::open("worker", store, ConnectionConfig::default()).await?;
//! ```

mod error;
mod memory;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "redis")]
pub mod redis;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use traits::{End, Store};

#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisStoreBuilder};
