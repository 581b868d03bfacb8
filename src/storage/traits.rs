//! The store contract the queue protocol is built on.
//!
//! All durable state lives in the shared store. The protocol only relies on
//! the primitives below, and every cross-list move is a single call so that
//! an implementation can make it atomic.

use std::time::Duration;

use async_trait::async_trait;

use super::error::StorageError;

/// One end of a list.
///
/// Publishing pushes onto [`End::Left`]; consumers take from [`End::Right`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Left,
    Right,
}

impl End {
    #[cfg_attr(not(feature = "redis"), allow(dead_code))]
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            End::Left => "LEFT",
            End::Right => "RIGHT",
        }
    }
}

/// Atomic list, set and expiring-key primitives of a shared key/value store.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers from other processes. Missing keys behave like empty lists and
/// sets, and lists or sets that become empty disappear.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Push `values` onto `end` of the list, in order. Returns the new length.
    async fn list_push(&self, key: &str, end: End, values: &[String])
        -> Result<usize, StorageError>;

    /// Length of the list at `key`.
    async fn list_len(&self, key: &str) -> Result<usize, StorageError>;

    /// Atomically pop one element from `from` of `source` and push it onto
    /// `to` of `destination`. Returns `None` when `source` is empty.
    async fn list_move(
        &self,
        source: &str,
        destination: &str,
        from: End,
        to: End,
    ) -> Result<Option<String>, StorageError>;

    /// Remove up to `count` occurrences of `value`, starting from the head.
    /// A `count` of zero removes every occurrence.
    async fn list_remove(&self, key: &str, count: usize, value: &str)
        -> Result<usize, StorageError>;

    /// Atomically remove one occurrence of `value` from `source` and, only if
    /// it was found, push it onto `to` of `destination`.
    async fn list_remove_and_push(
        &self,
        source: &str,
        value: &str,
        destination: &str,
        to: End,
    ) -> Result<bool, StorageError>;

    /// Add `member` to the set. Returns true if it was not present.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    /// Remove `member` from the set. Returns true if it was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    /// All members of the set, in no particular order.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// Cardinality of the set.
    async fn set_len(&self, key: &str) -> Result<usize, StorageError>;

    /// Write a plain value that expires after `ttl`, replacing any previous
    /// value and expiry.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StorageError>;

    /// True if the key exists and has not expired.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete a key of any type. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}
