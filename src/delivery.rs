//! Deliveries and the acknowledgment state machine.
//!
//! A [`Delivery`] is one payload sitting in its connection's unacked list.
//! It leaves that list exactly once, through [`Delivery::ack`],
//! [`Delivery::reject`] or [`Delivery::push`], or through recovery by a
//! cleaner. Losing the race against a cleaner is not an error: the call just
//! reports `false`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::{End, StorageError, Store};

/// Lifecycle state of a [`Delivery`]. Transitions only leave `Unacked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Handed to a consumer; processing not yet finished
    Unacked,
    /// Processed successfully and removed from the store
    Acked,
    /// Moved to the queue's rejected list
    Rejected,
    /// Moved to the ready list of the queue's push queue
    Pushed,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryState::Unacked => "unacked",
            DeliveryState::Acked => "acked",
            DeliveryState::Rejected => "rejected",
            DeliveryState::Pushed => "pushed",
        };
        f.write_str(name)
    }
}

/// A single payload taken from a queue's ready list.
pub struct Delivery {
    payload: String,
    state: DeliveryState,
    unacked_key: String,
    rejected_key: String,
    push_key: Option<String>,
    store: Arc<dyn Store>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &self.payload)
            .field("state", &self.state)
            .field("unacked_key", &self.unacked_key)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub(crate) fn new(
        payload: String,
        unacked_key: String,
        rejected_key: String,
        push_key: Option<String>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            payload,
            state: DeliveryState::Unacked,
            unacked_key,
            rejected_key,
            push_key,
            store,
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Remove the delivery from the unacked list.
    ///
    /// Returns `Ok(false)` if the delivery already left the unacked state or
    /// was no longer in the list (recovered by a cleaner).
    pub async fn ack(&mut self) -> Result<bool, StorageError> {
        if self.state != DeliveryState::Unacked {
            return Ok(false);
        }
        let removed = self
            .store
            .list_remove(&self.unacked_key, 1, &self.payload)
            .await?;
        if removed == 1 {
            self.state = DeliveryState::Acked;
            debug!(unacked = %self.unacked_key, "delivery acked");
            return Ok(true);
        }
        warn!(unacked = %self.unacked_key, "ack: delivery no longer unacked");
        Ok(false)
    }

    /// Move the delivery to the queue's rejected list.
    pub async fn reject(&mut self) -> Result<bool, StorageError> {
        let rejected_key = self.rejected_key.clone();
        self.move_to(&rejected_key, DeliveryState::Rejected).await
    }

    /// Move the delivery to the ready list of the queue's push queue.
    ///
    /// Without a push queue this is the same as [`Delivery::reject`].
    pub async fn push(&mut self) -> Result<bool, StorageError> {
        match self.push_key.clone() {
            Some(push_key) => self.move_to(&push_key, DeliveryState::Pushed).await,
            None => self.reject().await,
        }
    }

    async fn move_to(&mut self, destination: &str, state: DeliveryState) -> Result<bool, StorageError> {
        if self.state != DeliveryState::Unacked {
            return Ok(false);
        }
        let moved = self
            .store
            .list_remove_and_push(&self.unacked_key, &self.payload, destination, End::Left)
            .await?;
        if moved {
            self.state = state;
            debug!(unacked = %self.unacked_key, destination, %state, "delivery moved");
        } else {
            warn!(unacked = %self.unacked_key, %state, "delivery no longer unacked");
        }
        Ok(moved)
    }
}

/// An ordered batch of deliveries.
///
/// The batch operations apply the single-delivery operation to every member
/// and return how many of them failed; they never stop early.
#[derive(Debug, Default)]
pub struct Deliveries(Vec<Delivery>);

impl Deliveries {
    pub fn new(deliveries: Vec<Delivery>) -> Self {
        Self(deliveries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Delivery> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Delivery> {
        self.0.iter_mut()
    }

    pub fn payloads(&self) -> Vec<&str> {
        self.0.iter().map(Delivery::payload).collect()
    }

    pub fn into_inner(self) -> Vec<Delivery> {
        self.0
    }

    pub(crate) fn push_delivery(&mut self, delivery: Delivery) {
        self.0.push(delivery);
    }

    /// Ack every delivery. Returns the number of failures.
    pub async fn ack(&mut self) -> usize {
        let mut failed = 0;
        for delivery in &mut self.0 {
            failed += count_failure(delivery.ack().await, "ack");
        }
        failed
    }

    /// Reject every delivery. Returns the number of failures.
    pub async fn reject(&mut self) -> usize {
        let mut failed = 0;
        for delivery in &mut self.0 {
            failed += count_failure(delivery.reject().await, "reject");
        }
        failed
    }

    /// Push every delivery. Returns the number of failures.
    pub async fn push(&mut self) -> usize {
        let mut failed = 0;
        for delivery in &mut self.0 {
            failed += count_failure(delivery.push().await, "push");
        }
        failed
    }
}

fn count_failure(result: Result<bool, StorageError>, operation: &str) -> usize {
    match result {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            warn!(operation, error = %e, "batch delivery operation failed");
            1
        }
    }
}

impl From<Vec<Delivery>> for Deliveries {
    fn from(deliveries: Vec<Delivery>) -> Self {
        Self(deliveries)
    }
}

impl IntoIterator for Deliveries {
    type Item = Delivery;
    type IntoIter = std::vec::IntoIter<Delivery>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Deliveries {
    type Item = &'a Delivery;
    type IntoIter = std::slice::Iter<'a, Delivery>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
