//! In-process counter store.
//!
//! Counters live in this process only. Two server instances each keep their
//! own counts, so a client spread across N instances gets N times the
//! budget. Use the shared store when running more than one instance.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::Storage;
use crate::ratelimit::clock::{Clock, SystemClock};

/// A single fixed-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Hits recorded in the current window
    pub count: u64,
    /// When the current window ends (epoch seconds)
    pub expires_at: i64,
}

impl CounterRecord {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Process-local counter store.
///
/// Each key's record is mutated under its shard's write lock, so the
/// expire-then-increment step is atomic for concurrent callers.
pub struct LocalStorage {
    records: DashMap<String, CounterRecord>,
    clock: Arc<dyn Clock>,
}

impl LocalStorage {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Current record for `key`, including expired ones not yet purged.
    pub fn get(&self, key: &str) -> Option<CounterRecord> {
        self.records.get(key).map(|r| *r)
    }

    /// Remove every record whose window has ended. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_epoch_secs();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.records.len())
    }

    /// Number of records held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn increment(&self, key: &str, window_secs: u64) -> u64 {
        let now = self.clock.now_epoch_secs();
        let window = i64::try_from(window_secs).unwrap_or(i64::MAX);
        let fresh = CounterRecord {
            count: 0,
            expires_at: now.saturating_add(window),
        };

        let mut record = self.records.entry(key.to_string()).or_insert(fresh);
        if record.is_expired(now) {
            trace!(key = %key, "Window expired, starting a new one");
            *record = fresh;
        }
        record.count += 1;
        record.count
    }

    async fn ttl(&self, key: &str) -> u64 {
        let now = self.clock.now_epoch_secs();
        match self.records.get(key) {
            Some(record) if !record.is_expired(now) => record.expires_at.saturating_sub(now) as u64,
            _ => 0,
        }
    }

    async fn reset(&self, key: &str) {
        self.records.remove(key);
    }
}
