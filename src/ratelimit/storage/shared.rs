//! Counter store backed by a shared Redis-compatible server.
//!
//! Every instance talks to the same server, so budgets hold across a
//! fleet. Faults never reach the caller: an unreachable server fails open
//! and the request is counted as the first hit of a window.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::Storage;
use crate::error::{GuardError, Result};

/// INCR, and attach the window expiry when the key is new or has lost its TTL.
const INCR_WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 or redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Raw atomic counter operations against an external key-value service.
///
/// Unlike [`Storage`], these surface errors; [`SharedStorage`] decides what
/// to do with them.
#[async_trait]
pub trait CounterClient: Send + Sync {
    /// Atomically increment `key`, setting a `window_secs` expiry on the
    /// first hit of a window. Returns the new count.
    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<u64>;

    /// Remaining TTL in seconds. Negative when the key is missing or has no
    /// expiry.
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// Delete `key`.
    async fn del(&self, key: &str) -> Result<()>;
}

/// The cached connection, tagged with the generation it was opened in.
///
/// A failed command only drops the connection it ran on, so a slow failure
/// on an old connection cannot discard one that was just reopened. A failed
/// connect starts a backoff during which callers fail fast; calls failing
/// fast do not extend it.
struct ConnectionSlot<T> {
    conn: Option<(u64, T)>,
    generation: u64,
    failed_at: Option<Instant>,
}

impl<T: Clone> ConnectionSlot<T> {
    fn new() -> Self {
        Self {
            conn: None,
            generation: 0,
            failed_at: None,
        }
    }

    /// The open connection, `None` when a connect should be attempted, or an
    /// error while backing off.
    fn current(&self, backoff: Duration) -> Result<Option<(u64, T)>> {
        if let Some((generation, conn)) = &self.conn {
            return Ok(Some((*generation, conn.clone())));
        }
        match self.failed_at {
            Some(at) if at.elapsed() < backoff => Err(GuardError::Storage(
                "Redis unavailable, backing off".to_string(),
            )),
            _ => Ok(None),
        }
    }

    fn install(&mut self, conn: T) -> u64 {
        self.generation += 1;
        self.conn = Some((self.generation, conn));
        self.failed_at = None;
        self.generation
    }

    /// Forget the connection from `generation`, if it is still the current one.
    fn discard(&mut self, generation: u64) {
        if matches!(&self.conn, Some((current, _)) if *current == generation) {
            self.conn = None;
        }
    }

    /// Start the backoff after a failed connect.
    fn mark_failed(&mut self) {
        self.failed_at = Some(Instant::now());
    }
}

/// How far a call got before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Waiting,
    Connecting,
    Opened(u64),
}

/// Redis client with a lazily opened, reused multiplexed connection.
///
/// The connection is opened on first use by a single caller; the rest wait
/// for it. A failed command drops the connection and the next call
/// reconnects. Each call, lock wait and connect included, is bounded by
/// `timeout`.
pub struct RedisCounterClient {
    client: redis::Client,
    slot: parking_lot::Mutex<ConnectionSlot<MultiplexedConnection>>,
    connecting: Mutex<()>,
    script: redis::Script,
    timeout: Duration,
}

impl RedisCounterClient {
    /// Create a client for `url`. No connection is made until first use.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GuardError::config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            slot: parking_lot::Mutex::new(ConnectionSlot::new()),
            connecting: Mutex::new(()),
            script: redis::Script::new(INCR_WINDOW_SCRIPT),
            timeout,
        })
    }

    async fn connection(&self, progress: &mut Progress) -> Result<MultiplexedConnection> {
        let cached = self.slot.lock().current(self.timeout)?;
        if let Some((generation, conn)) = cached {
            *progress = Progress::Opened(generation);
            return Ok(conn);
        }

        let _connecting = self.connecting.lock().await;
        let cached = self.slot.lock().current(self.timeout)?;
        if let Some((generation, conn)) = cached {
            *progress = Progress::Opened(generation);
            return Ok(conn);
        }

        *progress = Progress::Connecting;
        let conn = self.client.get_multiplexed_async_connection().await?;
        let generation = self.slot.lock().install(conn.clone());
        *progress = Progress::Opened(generation);
        info!(generation = generation, "Connected to shared counter store");
        Ok(conn)
    }

    /// Run `op` on the shared connection, dropping the connection on failure.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let mut progress = Progress::Waiting;
        let attempt = tokio::time::timeout(self.timeout, async {
            let conn = self.connection(&mut progress).await?;
            op(conn).await.map_err(GuardError::Redis)
        })
        .await;

        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(GuardError::Storage("Redis call timed out".to_string())),
        };

        if result.is_err() {
            let mut slot = self.slot.lock();
            match progress {
                Progress::Opened(generation) => slot.discard(generation),
                Progress::Connecting => slot.mark_failed(),
                // Backing off, or timed out behind another caller's connect.
                Progress::Waiting => {}
            }
        }
        result
    }
}

#[async_trait]
impl CounterClient for RedisCounterClient {
    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<u64> {
        self.run(|mut conn| async move {
            self.script
                .key(key)
                .arg(window_secs)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.run(|mut conn| async move { redis::cmd("TTL").arg(key).query_async(&mut conn).await })
            .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.run(|mut conn| async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await
    }
}

/// Shared counter store. Fails open on any client error.
pub struct SharedStorage<C: CounterClient = RedisCounterClient> {
    client: C,
}

impl SharedStorage<RedisCounterClient> {
    /// Create a store talking to Redis at `url`.
    pub fn connect_lazy(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(RedisCounterClient::new(url, timeout)?))
    }
}

impl<C: CounterClient> SharedStorage<C> {
    /// Create a store over any counter client.
    pub fn with_client(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: CounterClient> Storage for SharedStorage<C> {
    async fn increment(&self, key: &str, window_secs: u64) -> u64 {
        match self.client.incr_window(key, window_secs).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key = %key, error = %e, "Shared counter increment failed, allowing request");
                1
            }
        }
    }

    async fn ttl(&self, key: &str) -> u64 {
        match self.client.ttl(key).await {
            Ok(ttl) if ttl > 0 => ttl as u64,
            Ok(_) => 0,
            Err(e) => {
                warn!(key = %key, error = %e, "Shared counter TTL lookup failed");
                0
            }
        }
    }

    async fn reset(&self, key: &str) {
        match self.client.del(key).await {
            Ok(()) => debug!(key = %key, "Shared counter reset"),
            Err(e) => warn!(key = %key, error = %e, "Shared counter reset failed"),
        }
    }
}
