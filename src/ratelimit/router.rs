//! Policy selection and strategy construction.
//!
//! The router owns the route table and the counter stores. For each
//! request it picks a policy, fetches (or builds once) the strategy for
//! that policy and runs the check.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::policy::{Policy, PolicyTable};
use super::request::RequestInfo;
use super::storage::{LocalStorage, Storage, StorageKind};
use super::strategy::{Decision, FixedWindowStrategy};
use crate::error::{GuardError, Result};

/// The counter stores available to policies.
///
/// Built once at startup and handed to the router; nothing else holds a
/// store.
#[derive(Clone)]
pub struct StorageBackends {
    local: Arc<dyn Storage>,
    shared: Option<Arc<dyn Storage>>,
}

impl StorageBackends {
    /// A process-local store only.
    pub fn local_only() -> Self {
        Self::new(Arc::new(LocalStorage::new()), None)
    }

    pub fn new(local: Arc<dyn Storage>, shared: Option<Arc<dyn Storage>>) -> Self {
        Self { local, shared }
    }

    /// The store for `kind`, if one was configured.
    pub fn get(&self, kind: StorageKind) -> Option<&Arc<dyn Storage>> {
        match kind {
            StorageKind::Local => Some(&self.local),
            StorageKind::Shared => self.shared.as_ref(),
        }
    }
}

/// Routes requests to rate limit strategies.
pub struct PolicyRouter {
    table: PolicyTable,
    backends: StorageBackends,
    clock: Arc<dyn Clock>,
    /// Strategies keyed by policy name
    strategies: RwLock<HashMap<String, Arc<FixedWindowStrategy>>>,
}

impl PolicyRouter {
    /// Create a router. Fails if a policy needs a store that is missing.
    pub fn new(table: PolicyTable, backends: StorageBackends) -> Result<Self> {
        Self::with_clock(table, backends, Arc::new(SystemClock))
    }

    /// Create a router whose verdicts use `clock` for reset times.
    pub fn with_clock(
        table: PolicyTable,
        backends: StorageBackends,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        for policy in table.policies() {
            if backends.get(policy.storage).is_none() {
                return Err(GuardError::config(format!(
                    "Policy {:?} uses {} storage, but no {} store is configured",
                    policy.name, policy.storage, policy.storage
                )));
            }
        }

        Ok(Self {
            table,
            backends,
            clock,
            strategies: RwLock::new(HashMap::new()),
        })
    }

    /// The route table.
    pub fn table(&self) -> &PolicyTable {
        &self.table
    }

    /// Select the policy for `req`, or `None` if the path is exempt.
    ///
    /// Pure; touches no counters.
    pub fn resolve(&self, req: &RequestInfo) -> Option<Arc<Policy>> {
        if self.table.is_exempt(&req.path) {
            trace!(path = %req.path, "Path exempt from rate limiting");
            return None;
        }

        let policy = self
            .table
            .rules
            .iter()
            .find(|rule| rule.matches(req))
            .map(|rule| &rule.policy)
            .unwrap_or(&self.table.default);

        Some(Arc::clone(policy))
    }

    /// The strategy enforcing `policy`, built on first use.
    pub fn strategy_for(&self, policy: &Arc<Policy>) -> Result<Arc<FixedWindowStrategy>> {
        if let Some(strategy) = self.strategies.read().get(&policy.name) {
            return Ok(Arc::clone(strategy));
        }

        let storage = self.backends.get(policy.storage).cloned().ok_or_else(|| {
            GuardError::config(format!("No {} store configured", policy.storage))
        })?;

        let mut strategies = self.strategies.write();
        let strategy = strategies.entry(policy.name.clone()).or_insert_with(|| {
            debug!(
                policy = %policy.name,
                storage = %policy.storage,
                key_generator = ?policy.key_generator,
                "Creating rate limit strategy"
            );
            let keys = policy
                .key_generator
                .build(&policy.key_prefix, policy.credential_header.as_deref());
            Arc::new(FixedWindowStrategy::with_clock(
                Arc::clone(policy),
                storage,
                keys,
                Arc::clone(&self.clock),
            ))
        });

        Ok(Arc::clone(strategy))
    }

    /// Run the rate limit check for `req`.
    ///
    /// Returns `None` for exempt paths.
    pub async fn check(&self, req: &RequestInfo) -> Result<Option<Decision>> {
        let Some(policy) = self.resolve(req) else {
            return Ok(None);
        };

        let strategy = self.strategy_for(&policy)?;
        Ok(Some(strategy.check(req).await))
    }

    /// Number of strategies built so far.
    pub fn strategy_count(&self) -> usize {
        self.strategies.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use axum::http::Method;

    fn router() -> (Arc<ManualClock>, PolicyRouter) {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let backends =
            StorageBackends::new(Arc::new(LocalStorage::with_clock(clock.clone())), None);
        let table = PolicyTable::marketplace(StorageKind::Local).unwrap();
        let router = PolicyRouter::with_clock(table, backends, clock.clone()).unwrap();
        (clock, router)
    }

    fn request(method: Method, path: &str) -> RequestInfo {
        RequestInfo::new(method, path).with_header("x-forwarded-for", "203.0.113.7")
    }

    fn resolved_name(router: &PolicyRouter, method: Method, path: &str) -> Option<String> {
        router
            .resolve(&request(method, path))
            .map(|p| p.name.clone())
    }

    #[test]
    fn test_resolve_mint_policy() {
        let (_clock, router) = router();
        let policy = router
            .resolve(&request(Method::POST, "/api/digimons/mint"))
            .unwrap();

        assert_eq!(policy.name, "mint");
        assert_eq!(policy.max_requests, 5);
    }

    #[test]
    fn test_resolve_by_method_and_path() {
        let (_clock, router) = router();

        assert_eq!(
            resolved_name(&router, Method::POST, "/api/marketplace/buy/42").as_deref(),
            Some("marketplace")
        );
        assert_eq!(
            resolved_name(&router, Method::GET, "/api/digimons/mint").as_deref(),
            Some("read")
        );
        assert_eq!(
            resolved_name(&router, Method::GET, "/api/marketplace/listings").as_deref(),
            Some("read")
        );
        assert_eq!(
            resolved_name(&router, Method::DELETE, "/api/digimons/7").as_deref(),
            Some("default")
        );
        assert_eq!(
            resolved_name(&router, Method::POST, "/api/marketplace/refund").as_deref(),
            Some("default")
        );
    }

    #[test]
    fn test_resolve_skips_exempt_paths() {
        let (_clock, router) = router();

        assert_eq!(resolved_name(&router, Method::POST, "/api/auth/callback/credentials"), None);
        assert_eq!(resolved_name(&router, Method::GET, "/api/auth/session"), None);
        assert_eq!(resolved_name(&router, Method::GET, "/marketplace"), None);
        assert_eq!(resolved_name(&router, Method::GET, "/_next/static/app.js"), None);
    }

    #[test]
    fn test_resolve_does_not_touch_counters() {
        let (_clock, router) = router();
        for _ in 0..100 {
            router.resolve(&request(Method::POST, "/api/digimons/mint"));
        }
        assert_eq!(router.strategy_count(), 0);
    }

    #[tokio::test]
    async fn test_mint_scenario() {
        let (clock, router) = router();
        let req = request(Method::POST, "/api/digimons/mint");

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let decision = router.check(&req).await.unwrap().unwrap();
            assert!(decision.verdict.allowed);
            remaining.push(decision.verdict.remaining);
            clock.advance(2);
        }
        assert_eq!(remaining, [4, 3, 2, 1, 0]);

        let decision = router.check(&req).await.unwrap().unwrap();
        assert!(!decision.verdict.allowed);
        let denial = decision.denial.unwrap();
        assert!(denial.body.retry_after > 0 && denial.body.retry_after <= 60);

        clock.advance(61);
        let verdict = router.check(&req).await.unwrap().unwrap().verdict;
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 4);
    }

    #[tokio::test]
    async fn test_auth_callback_never_denied() {
        let (_clock, router) = router();
        let req = request(Method::POST, "/api/auth/callback/credentials");

        for _ in 0..1_000 {
            assert!(router.check(&req).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_strategies_reused_per_policy() {
        let (_clock, router) = router();

        router.check(&request(Method::POST, "/api/digimons/mint")).await.unwrap();
        router.check(&request(Method::POST, "/api/digimons/mint/")).await.unwrap();
        assert_eq!(router.strategy_count(), 1);

        router.check(&request(Method::GET, "/api/digimons")).await.unwrap();
        router.check(&request(Method::GET, "/api/users/me")).await.unwrap();
        assert_eq!(router.strategy_count(), 2);

        let mint = router.resolve(&request(Method::POST, "/api/digimons/mint")).unwrap();
        assert!(Arc::ptr_eq(
            &router.strategy_for(&mint).unwrap(),
            &router.strategy_for(&mint).unwrap()
        ));
    }

    #[tokio::test]
    async fn test_policies_have_separate_budgets() {
        let (_clock, router) = router();
        let mint = request(Method::POST, "/api/digimons/mint");

        for _ in 0..6 {
            router.check(&mint).await.unwrap();
        }
        assert!(!router.check(&mint).await.unwrap().unwrap().verdict.allowed);

        let read = router
            .check(&request(Method::GET, "/api/digimons"))
            .await
            .unwrap()
            .unwrap();
        assert!(read.verdict.allowed);
        assert_eq!(read.verdict.remaining, 99);
    }

    #[test]
    fn test_shared_policy_without_shared_store_is_rejected() {
        let table = PolicyTable::marketplace(StorageKind::Shared).unwrap();
        let result = PolicyRouter::new(table, StorageBackends::local_only());

        assert!(matches!(result, Err(GuardError::Config(_))));
    }
}
