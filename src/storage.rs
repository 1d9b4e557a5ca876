//! Local store for values held on behalf of the network.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use tracing::trace;

use crate::common::Id;
use crate::rpc::DEFAULT_STORAGE_CAPACITY;
use crate::{Error, Result};

/// Where a stored value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Put by the local node, republished periodically.
    Published,
    /// Received from another node, replicated periodically.
    Replica,
}

/// Key value store used to answer FIND_VALUE requests.
pub trait Storage: Debug + Send {
    /// Store `value` under `key` until `ttl` elapses, replacing any previous value.
    fn put(&mut self, key: Id, value: Bytes, ttl: Duration, origin: Origin);

    /// Returns [Error::NotFound] for missing or expired keys.
    fn get(&mut self, key: &Id) -> Result<Bytes>;

    /// Drop every value expired at `now`, returns how many were dropped.
    fn sweep_expired(&mut self, now: Instant) -> usize;

    /// Unexpired values with the given origin.
    fn entries(&self, origin: Origin) -> Vec<(Id, Bytes)>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
    origin: Origin,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In memory [Storage], evicting the least recently used value when full.
#[derive(Debug)]
pub struct MemoryStorage {
    values: LruCache<Id, Entry>,
}

impl MemoryStorage {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(
            NonZeroUsize::new(DEFAULT_STORAGE_CAPACITY)
                .expect("DEFAULT_STORAGE_CAPACITY is NonZeroUsize"),
        );

        Self {
            values: LruCache::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_STORAGE_CAPACITY)
    }
}

impl Storage for MemoryStorage {
    fn put(&mut self, key: Id, value: Bytes, ttl: Duration, origin: Origin) {
        // A value we published stays ours even if a replica of it comes back.
        let origin = match self.values.peek(&key) {
            Some(existing) if existing.origin == Origin::Published => Origin::Published,
            _ => origin,
        };

        self.values.put(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                origin,
            },
        );
    }

    fn get(&mut self, key: &Id) -> Result<Bytes> {
        match self.values.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => Ok(entry.value.clone()),
            _ => Err(Error::NotFound(*key)),
        }
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Id> = self
            .values
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            self.values.pop(key);
        }

        if !expired.is_empty() {
            trace!(count = expired.len(), "Swept expired values");
        }

        expired.len()
    }

    fn entries(&self, origin: Origin) -> Vec<(Id, Bytes)> {
        let now = Instant::now();

        self.values
            .iter()
            .filter(|(_, entry)| entry.origin == origin && !entry.is_expired(now))
            .map(|(key, entry)| (*key, entry.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DAY: Duration = Duration::from_secs(86400);

    #[test]
    fn put_get() {
        let mut storage = MemoryStorage::default();
        let key = Id::random();

        assert_eq!(storage.get(&key), Err(Error::NotFound(key)));

        storage.put(key, Bytes::from_static(b"one"), DAY, Origin::Replica);
        storage.put(key, Bytes::from_static(b"two"), DAY, Origin::Replica);

        assert_eq!(storage.get(&key), Ok(Bytes::from_static(b"two")));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn expired_values_are_hidden_then_swept() {
        let mut storage = MemoryStorage::default();
        let expired = Id::random();
        let alive = Id::random();

        storage.put(expired, Bytes::from_static(b"old"), Duration::ZERO, Origin::Replica);
        storage.put(alive, Bytes::from_static(b"new"), DAY, Origin::Replica);

        assert_eq!(storage.get(&expired), Err(Error::NotFound(expired)));
        assert_eq!(storage.entries(Origin::Replica).len(), 1);

        assert_eq!(storage.sweep_expired(Instant::now()), 1);
        assert_eq!(storage.len(), 1);

        assert_eq!(storage.sweep_expired(Instant::now() + DAY * 2), 1);
        assert!(storage.is_empty());
    }

    #[test]
    fn entries_by_origin() {
        let mut storage = MemoryStorage::default();
        let published = Id::random();
        let replica = Id::random();

        storage.put(published, Bytes::from_static(b"p"), DAY, Origin::Published);
        storage.put(replica, Bytes::from_static(b"r"), DAY, Origin::Replica);
        // Replicas of our own values don't demote them.
        storage.put(published, Bytes::from_static(b"p"), DAY, Origin::Replica);

        assert_eq!(
            storage.entries(Origin::Published),
            vec![(published, Bytes::from_static(b"p"))]
        );
        assert_eq!(
            storage.entries(Origin::Replica),
            vec![(replica, Bytes::from_static(b"r"))]
        );
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut storage = MemoryStorage::new(2);
        let keys: Vec<_> = (0..3).map(|_| Id::random()).collect();

        for key in &keys {
            storage.put(*key, Bytes::from_static(b"v"), DAY, Origin::Replica);
        }

        assert_eq!(storage.len(), 2);
        assert!(storage.get(&keys[0]).is_err());
        assert!(storage.get(&keys[2]).is_ok());
    }
}
