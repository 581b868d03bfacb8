//! Store wrapper for exercising failure paths in unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::error::StorageError;
use super::memory::MemoryStore;
use super::traits::{End, Store};

/// A [`MemoryStore`] that can be told to fail reads of chosen sets, or to
/// add a member right after one was removed (as a concurrent writer would).
#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    failing_sets: Mutex<HashSet<String>>,
    re_add: Mutex<Option<(String, String)>>,
}

impl FaultyStore {
    pub(crate) fn fail_set_members(&self, key: &str) {
        self.failing_sets.lock().unwrap().insert(key.to_string());
    }

    pub(crate) fn heal(&self) {
        self.failing_sets.lock().unwrap().clear();
    }

    /// After the next removal from `key`, add `member` to it.
    pub(crate) fn re_add_after_remove(&self, key: &str, member: &str) {
        *self.re_add.lock().unwrap() = Some((key.to_string(), member.to_string()));
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn list_push(&self, key: &str, end: End, values: &[String]) -> Result<usize, StorageError> {
        self.inner.list_push(key, end, values).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StorageError> {
        self.inner.list_len(key).await
    }

    async fn list_move(
        &self,
        source: &str,
        destination: &str,
        from: End,
        to: End,
    ) -> Result<Option<String>, StorageError> {
        self.inner.list_move(source, destination, from, to).await
    }

    async fn list_remove(&self, key: &str, count: usize, value: &str) -> Result<usize, StorageError> {
        self.inner.list_remove(key, count, value).await
    }

    async fn list_remove_and_push(
        &self,
        source: &str,
        value: &str,
        destination: &str,
        to: End,
    ) -> Result<bool, StorageError> {
        self.inner
            .list_remove_and_push(source, value, destination, to)
            .await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let removed = self.inner.set_remove(key, member).await?;
        let re_add = {
            let mut re_add = self.re_add.lock().unwrap();
            let hit = matches!(re_add.as_ref(), Some((target, _)) if target == key);
            if hit {
                re_add.take()
            } else {
                None
            }
        };
        if let Some((target, member)) = re_add {
            self.inner.set_add(&target, &member).await?;
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let failing = self.failing_sets.lock().unwrap().contains(key);
        if failing {
            return Err(StorageError::Unavailable("boom".into()));
        }
        self.inner.set_members(key).await
    }

    async fn set_len(&self, key: &str) -> Result<usize, StorageError> {
        self.inner.set_len(key).await
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.delete(key).await
    }
}
