//! Counter stores backing the fixed-window strategy.
//!
//! A store owns every counter record. Callers see three operations and
//! never hold a record across calls.

mod local;
mod shared;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use local::{CounterRecord, LocalStorage};
pub use shared::{CounterClient, RedisCounterClient, SharedStorage};

/// Trait for counter store implementations.
///
/// Implementations must serialize increments per key: concurrent calls for
/// the same key observe a strictly increasing sequence of counts. None of
/// these operations fail from the caller's point of view; stores that talk
/// to the network absorb and log their own faults.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Add one hit to `key` and return the new count.
    ///
    /// A missing or expired record starts a fresh window of `window_secs`
    /// with a count of 1.
    async fn increment(&self, key: &str, window_secs: u64) -> u64;

    /// Seconds left in the current window for `key`, or 0 if there is none.
    async fn ttl(&self, key: &str) -> u64;

    /// Drop the record for `key` so the next increment opens a new window.
    async fn reset(&self, key: &str);
}

/// Which counter store a policy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Process-local map. Only correct for single-instance deployments.
    Local,
    /// External Redis-compatible store shared by every instance.
    Shared,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Local => write!(f, "local"),
            StorageKind::Shared => write!(f, "shared"),
        }
    }
}
