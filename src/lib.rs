//! # rmq
//!
//! A reliable message queue on top of Redis (or any store implementing
//! [`storage::Store`]).
//!
//! Producers publish payloads onto a queue's ready list. Consumers move them
//! atomically into an unacked list owned by their [`Connection`] and then
//! ack, reject or push each [`Delivery`]. Every connection keeps a heartbeat;
//! when a process dies, a [`Cleaner`] running anywhere else returns its
//! unacked deliveries to ready. Delivery is at-least-once.
//!
//! ## Features
//!
//! - **At-least-once delivery**: payloads only leave the store on ack
//! - **Crash recovery**: heartbeats plus a cleaner that any process can run
//! - **Prefetching consumers**: single or batch callbacks on tokio tasks
//! - **Rejected and push queues**: failed work is kept, not dropped
//! - **Stats**: text, HTML and JSON snapshots, with an optional axum router
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use rmq::{Connection, ConnectionConfig, Consumer, Delivery, RedisStore};
//!
//! struct Mailer;
//!
//! #[async_trait]
//! impl Consumer for Mailer {
//!     async fn consume(&self, mut delivery: Delivery) {
//!         println!("sending {}", delivery.payload());
//!         if let Err(e) = delivery.ack().await {
//!             eprintln!("ack failed: {}", e);
//!         }
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::builder()
//!     .redis_url("redis://127.0.0.1:6379")
//!     .build()
//!     .await?;
//! let connection = Connection::open("mailer", Arc::new(store), ConnectionConfig::default()).await?;
//!
//! let queue = connection.open_queue("emails").await?;
//! queue.publish("hello@example.com").await?;
//!
//! queue.start_consuming(10, Duration::from_millis(100)).await?;
//! queue.add_consumer("mailer", Mailer).await?;
//! # Ok(())
//! # }
//! ```

pub mod cleaner;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod observability;
pub mod queue;
pub mod storage;

pub use cleaner::{CleanReport, Cleaner};
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use consumer::{BatchConsumer, Consumer};
pub use delivery::{Deliveries, Delivery, DeliveryState};
pub use error::{Error, Result};
pub use observability::{Layout, Stats};
pub use queue::Queue;
pub use storage::{MemoryStore, StorageError, Store};

#[cfg(feature = "redis")]
pub use storage::{RedisStore, RedisStoreBuilder};

#[cfg(feature = "axum-ui")]
pub use observability::stats_ui;
