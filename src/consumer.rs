//! Consumer callbacks.

use async_trait::async_trait;

use crate::delivery::{Deliveries, Delivery};

/// Handles one delivery at a time.
///
/// The consumer owns the delivery and must ack, reject or push it; anything
/// left unacked is returned to ready by a graceful shutdown or a cleaner.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn consume(&self, delivery: Delivery);
}

/// Handles deliveries in batches.
#[async_trait]
pub trait BatchConsumer: Send + Sync + 'static {
    async fn consume(&self, batch: Deliveries);
}
