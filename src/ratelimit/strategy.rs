//! Fixed-window rate limiting strategy.
//!
//! Each check costs one `increment` and one `ttl` call on the store. The
//! window resets fully at its boundary, so a client can land up to twice
//! the limit across two adjacent windows.

use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::key::KeyGenerator;
use super::policy::Policy;
use super::request::RequestInfo;
use super::storage::Storage;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// The outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Hits allowed per window
    pub limit: u64,
    /// Hits left in the current window
    pub remaining: u64,
    /// When the current window ends (epoch seconds)
    pub reset_at: i64,
    /// Seconds to wait before retrying; set only when denied
    pub retry_after: Option<u64>,
}

impl Verdict {
    /// The `X-RateLimit-*` headers describing this verdict.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at.to_string()),
        ]
    }
}

/// JSON body sent with a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

/// A ready-to-send 429 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenialResponse {
    pub status: StatusCode,
    pub body: DenialBody,
    pub headers: Vec<(&'static str, String)>,
}

impl DenialResponse {
    fn new(verdict: &Verdict, retry_after: u64, message: &str) -> Self {
        let mut headers = vec![(HEADER_RETRY_AFTER, retry_after.to_string())];
        headers.extend(verdict.headers());

        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: DenialBody {
                error: "Too Many Requests".to_string(),
                message: message.to_string(),
                retry_after,
            },
            headers,
        }
    }
}

impl IntoResponse for DenialResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        let headers = response.headers_mut();
        for (name, value) in self.headers {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
        response
    }
}

/// A verdict and, when denied, the response to send instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Name of the policy that decided
    pub policy: String,
    pub verdict: Verdict,
    pub denial: Option<DenialResponse>,
}

/// Fixed-window limiter wired to one policy, store and key generator.
///
/// Holds no counters itself; all state lives in the store.
pub struct FixedWindowStrategy {
    policy: Arc<Policy>,
    storage: Arc<dyn Storage>,
    keys: Box<dyn KeyGenerator>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowStrategy {
    /// Create a strategy that uses the system clock.
    pub fn new(
        policy: Arc<Policy>,
        storage: Arc<dyn Storage>,
        keys: Box<dyn KeyGenerator>,
    ) -> Self {
        Self::with_clock(policy, storage, keys, Arc::new(SystemClock))
    }

    /// Create a strategy with an explicit clock.
    pub fn with_clock(
        policy: Arc<Policy>,
        storage: Arc<dyn Storage>,
        keys: Box<dyn KeyGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            storage,
            keys,
            clock,
        }
    }

    /// The policy this strategy enforces.
    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Record one hit for `req` and decide whether it may proceed.
    pub async fn check(&self, req: &RequestInfo) -> Decision {
        let key = self.keys.generate_key(req);
        let limit = self.policy.max_requests;

        let count = self.storage.increment(&key, self.policy.window_seconds).await;
        let ttl = self.storage.ttl(&key).await;

        trace!(
            key = %key,
            policy = %self.policy.name,
            count = count,
            ttl = ttl,
            "Checked rate limit"
        );

        let allowed = count <= limit;
        let mut verdict = Verdict {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: self.clock.now_epoch_secs() + ttl as i64,
            retry_after: None,
        };

        if allowed {
            return Decision {
                policy: self.policy.name.clone(),
                verdict,
                denial: None,
            };
        }

        // A window that lapsed between the two store calls still deserves a
        // non-zero Retry-After.
        let retry_after = ttl.max(1);
        verdict.retry_after = Some(retry_after);

        debug!(
            key = %key,
            policy = %self.policy.name,
            count = count,
            limit = limit,
            retry_after = retry_after,
            "Rate limit exceeded"
        );

        Decision {
            policy: self.policy.name.clone(),
            denial: Some(DenialResponse::new(&verdict, retry_after, &self.policy.message)),
            verdict,
        }
    }

    /// Clear the window `req` falls into.
    pub async fn reset(&self, req: &RequestInfo) {
        let key = self.keys.generate_key(req);
        self.storage.reset(&key).await;
    }
}
