//! In-process store.
//!
//! [`MemoryStore`] keeps every key in a single map behind a mutex, which makes
//! each operation trivially atomic. It is meant for tests and for embedding
//! the queue inside one process; it follows the Redis semantics the protocol
//! depends on (empty lists and sets vanish, expired keys are gone).

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::error::StorageError;
use super::traits::{End, Store};

#[derive(Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn persistent(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// A [`Store`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Internal("memory store lock poisoned".into()))?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries)
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a mut VecDeque<String>>, StorageError> {
    match entries.get_mut(key) {
        None => Ok(None),
        Some(Entry {
            value: Value::List(list),
            ..
        }) => Ok(Some(list)),
        Some(_) => Err(StorageError::WrongType(key.to_string())),
    }
}

fn list_or_insert<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, StorageError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::persistent(Value::List(VecDeque::new())));
    match &mut entry.value {
        Value::List(list) => Ok(list),
        _ => Err(StorageError::WrongType(key.to_string())),
    }
}

fn set_ref<'a>(
    entries: &'a HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a BTreeSet<String>>, StorageError> {
    match entries.get(key) {
        None => Ok(None),
        Some(Entry {
            value: Value::Set(set),
            ..
        }) => Ok(Some(set)),
        Some(_) => Err(StorageError::WrongType(key.to_string())),
    }
}

fn push(list: &mut VecDeque<String>, end: End, value: String) {
    match end {
        End::Left => list.push_front(value),
        End::Right => list.push_back(value),
    }
}

fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    let empty = match entries.get(key).map(|entry| &entry.value) {
        Some(Value::List(list)) => list.is_empty(),
        Some(Value::Set(set)) => set.is_empty(),
        _ => false,
    };
    if empty {
        entries.remove(key);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_push(
        &self,
        key: &str,
        end: End,
        values: &[String],
    ) -> Result<usize, StorageError> {
        let mut entries = self.lock()?;
        if values.is_empty() {
            return Ok(list_mut(&mut entries, key)?.map_or(0, |list| list.len()));
        }
        let list = list_or_insert(&mut entries, key)?;
        for value in values {
            push(list, end, value.clone());
        }
        Ok(list.len())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StorageError> {
        let mut entries = self.lock()?;
        Ok(list_mut(&mut entries, key)?.map_or(0, |list| list.len()))
    }

    async fn list_move(
        &self,
        source: &str,
        destination: &str,
        from: End,
        to: End,
    ) -> Result<Option<String>, StorageError> {
        let mut entries = self.lock()?;
        // Redis checks the destination type before popping.
        list_mut(&mut entries, destination)?;
        let popped = match list_mut(&mut entries, source)? {
            Some(list) => match from {
                End::Left => list.pop_front(),
                End::Right => list.pop_back(),
            },
            None => None,
        };
        let Some(value) = popped else {
            return Ok(None);
        };
        drop_if_empty(&mut entries, source);
        push(list_or_insert(&mut entries, destination)?, to, value.clone());
        Ok(Some(value))
    }

    async fn list_remove(
        &self,
        key: &str,
        count: usize,
        value: &str,
    ) -> Result<usize, StorageError> {
        let mut entries = self.lock()?;
        let Some(list) = list_mut(&mut entries, key)? else {
            return Ok(0);
        };
        let mut removed = 0;
        list.retain(|item| {
            if item == value && (count == 0 || removed < count) {
                removed += 1;
                false
            } else {
                true
            }
        });
        drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn list_remove_and_push(
        &self,
        source: &str,
        value: &str,
        destination: &str,
        to: End,
    ) -> Result<bool, StorageError> {
        let mut entries = self.lock()?;
        list_mut(&mut entries, destination)?;
        let Some(list) = list_mut(&mut entries, source)? else {
            return Ok(false);
        };
        let Some(position) = list.iter().position(|item| item == value) else {
            return Ok(false);
        };
        list.remove(position);
        drop_if_empty(&mut entries, source);
        push(
            list_or_insert(&mut entries, destination)?,
            to,
            value.to_string(),
        );
        Ok(true)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut entries = self.lock()?;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::persistent(Value::Set(BTreeSet::new())));
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(StorageError::WrongType(key.to_string())),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut entries = self.lock()?;
        let removed = match entries.get_mut(key) {
            None => false,
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.remove(member),
            Some(_) => return Err(StorageError::WrongType(key.to_string())),
        };
        drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.lock()?;
        Ok(set_ref(&entries, key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> Result<usize, StorageError> {
        let entries = self.lock()?;
        Ok(set_ref(&entries, key)?.map_or(0, |set| set.len()))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock()?.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock()?.remove(key).is_some())
    }
}
