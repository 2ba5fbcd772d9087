//! Bounded, expiring record stores behind the authorization server.
//!
//! Every map the server keeps (clients, pending authorizations, codes,
//! access and refresh tokens) goes through [`RecordStore`]. Capacity and
//! expiry are part of the contract: `get` and `take` never return an
//! expired record, and `put` never grows a store past its capacity.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("store is at capacity ({0} entries)")]
    Full(usize),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// What `put` does when a store is full after dropping expired records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overflow {
    /// Refuse the new record
    Reject,
    /// Drop the oldest record to make room
    EvictOldest,
}

/// Capacity and overflow policy of one store
#[derive(Clone, Copy, Debug)]
pub struct Bounds {
    pub capacity: usize,
    pub overflow: Overflow,
}

impl Bounds {
    pub fn reject(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            overflow: Overflow::Reject,
        }
    }

    pub fn evict_oldest(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            overflow: Overflow::EvictOldest,
        }
    }
}

pub trait RecordStore<V>: Send + Sync {
    /// Look up a live record. Expired records are removed on the way.
    fn get(&self, key: &str) -> Result<Option<V>, RecordError>;

    /// Insert or replace a record.
    fn put(&self, key: &str, value: V, expires_at: Option<DateTime<Utc>>) -> Result<(), RecordError>;

    /// Remove and return a live record in one step. Two concurrent takes of
    /// the same key never both succeed.
    fn take(&self, key: &str) -> Result<Option<V>, RecordError>;

    fn delete(&self, key: &str) -> Result<bool, RecordError>;

    /// Drop every expired record, returning how many were removed.
    fn sweep(&self) -> Result<usize, RecordError>;

    fn len(&self) -> Result<usize, RecordError>;
}

struct Entry<V> {
    value: V,
    expires_at: Option<DateTime<Utc>>,
    seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct MemoryInner<V> {
    entries: HashMap<String, Entry<V>>,
    next_seq: u64,
}

/// Lock-protected in-memory store for short-lived records
pub struct MemoryStore<V> {
    inner: Mutex<MemoryInner<V>>,
    bounds: Bounds,
}

impl<V> MemoryStore<V> {
    pub fn new(bounds: Bounds) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            bounds,
        }
    }
}

impl<V: Clone + Send> RecordStore<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Result<Option<V>, RecordError> {
        let mut inner = self.inner.lock().expect("record store lock poisoned");
        let now = Utc::now();

        match inner.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: V, expires_at: Option<DateTime<Utc>>) -> Result<(), RecordError> {
        let mut inner = self.inner.lock().expect("record store lock poisoned");
        let now = Utc::now();

        if !inner.entries.contains_key(key) && inner.entries.len() >= self.bounds.capacity {
            inner.entries.retain(|_, entry| !entry.is_expired(now));

            while inner.entries.len() >= self.bounds.capacity {
                if self.bounds.overflow == Overflow::Reject {
                    return Err(RecordError::Full(self.bounds.capacity));
                }
                let oldest = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.seq)
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(oldest) => {
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<V>, RecordError> {
        let mut inner = self.inner.lock().expect("record store lock poisoned");
        let now = Utc::now();

        Ok(inner
            .entries
            .remove(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value))
    }

    fn delete(&self, key: &str) -> Result<bool, RecordError> {
        let mut inner = self.inner.lock().expect("record store lock poisoned");
        Ok(inner.entries.remove(key).is_some())
    }

    fn sweep(&self) -> Result<usize, RecordError> {
        let mut inner = self.inner.lock().expect("record store lock poisoned");
        let now = Utc::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - inner.entries.len())
    }

    fn len(&self) -> Result<usize, RecordError> {
        Ok(self.inner.lock().expect("record store lock poisoned").entries.len())
    }
}
