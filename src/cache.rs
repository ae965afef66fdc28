//! Run-scoped key/value cache with per-entry TTL
//!
//! Nothing here is persisted. An entry fetched at `t0` with ttl `d` is fresh
//! for `t0 <= t < t0 + d`.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::clock::Clock;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub payload: V,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.fetched_at + self.ttl
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.fetched_at + self.ttl
    }
}

pub struct MemoryCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    /// Fresh payload only
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh_at(now))
            .map(|entry| entry.payload.clone())
    }

    /// Explicit fallback read that ignores expiry
    pub fn get_stale(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, payload: V, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            fetched_at: self.clock.now(),
            ttl,
        };
        self.entries.insert(key, entry);
    }

    /// Mutate a cached payload in place without touching its freshness.
    /// Returns false when the key is absent.
    pub fn update<F>(&mut self, key: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        match self.entries.get_mut(key) {
            Some(entry) => {
                mutate(&mut entry.payload);
                true
            }
            None => false,
        }
    }

    pub fn invalidate(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.payload)
    }

    /// Return a fresh hit, or compute, store and return a new value.
    ///
    /// A failing `compute` stores nothing and its error is returned as is.
    pub async fn get_or_compute<F, Fut, E>(&mut self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let value = compute().await?;
        self.insert(key, value.clone(), ttl);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
