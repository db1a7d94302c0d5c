//! In-memory counter backend.
//!
//! Suitable for a single process: tests, local development, or deployments
//! where every request for a subject lands on the same instance. Expiry is
//! evaluated lazily against [`tokio::time::Instant`], so tests can drive it
//! with a paused clock.
//!
//! Without a counter window, counters never expire: an address that stays
//! under its limit keeps its entry until the process exits, so the map grows
//! with the number of distinct clients. Only windowed counters and block
//! markers are reclaimed by [`MemoryStorage::purge_expired`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use super::storage::{LimiterStorage, StorageError};
use super::subject::SubjectKey;

/// A counter value with an optional expiry.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of [`LimiterStorage`].
///
/// Counters live in a sharded map so increments on different subjects do
/// not contend. Block markers are read on every request and written only on
/// the rejecting transition, so they sit behind a read-write lock.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    counters: DashMap<String, CounterEntry>,
    blocks: RwLock<HashMap<String, Instant>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current counter value for a subject.
    ///
    /// Returns `None` if no live counter exists for the key.
    pub fn counter_value(&self, key: &SubjectKey) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key.as_str())
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
    }

    /// Get the number of stored counters, including expired ones not yet purged.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop expired counters and block markers.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();

        let counters_before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        let counters_removed = counters_before - self.counters.len();

        let mut blocks = self.blocks.write();
        let blocks_before = blocks.len();
        blocks.retain(|_, expires_at| *expires_at > now);
        let blocks_removed = blocks_before - blocks.len();

        counters_removed + blocks_removed
    }
}

#[async_trait]
impl LimiterStorage for MemoryStorage {
    async fn increment(
        &self,
        key: &SubjectKey,
        window: Option<Duration>,
    ) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.as_str().to_string())
            .or_insert(CounterEntry {
                count: 0,
                expires_at: None,
            });

        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at = None;
        }

        entry.count += 1;
        if entry.expires_at.is_none() {
            entry.expires_at = window.map(|window| now + window);
        }
        trace!(key = %key, count = entry.count, "Incremented counter");
        Ok(entry.count)
    }

    async fn is_blocked(&self, key: &SubjectKey) -> Result<bool, StorageError> {
        let now = Instant::now();
        let blocks = self.blocks.read();
        Ok(blocks
            .get(key.as_str())
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn block(&self, key: &SubjectKey, duration: Duration) -> Result<(), StorageError> {
        let expires_at = Instant::now() + duration;
        self.blocks
            .write()
            .insert(key.as_str().to_string(), expires_at);
        Ok(())
    }

    async fn reset(&self, key: &SubjectKey) -> Result<(), StorageError> {
        self.counters.remove(key.as_str());
        Ok(())
    }
}
