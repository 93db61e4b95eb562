//! Axum middleware applying rate limit decisions to requests.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use crate::ratelimit::{Decision, DenialResponse, PolicyRouter, RequestInfo, Verdict};

/// Name of the policy applied to a request, set as a request extension
/// before the handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPolicy(pub String);

/// What the middleware does with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// No policy applies; forward untouched
    PassThrough,
    /// Forward and annotate the response with the verdict
    Allow(Verdict),
    /// Answer with the denial and skip the handler
    Deny(DenialResponse),
}

impl From<Option<Decision>> for Action {
    fn from(decision: Option<Decision>) -> Self {
        match decision {
            None => Action::PassThrough,
            Some(Decision {
                denial: Some(denial),
                ..
            }) => Action::Deny(denial),
            Some(Decision { verdict, .. }) => Action::Allow(verdict),
        }
    }
}

/// Add the `X-RateLimit-*` headers for `verdict`.
///
/// Existing values are replaced. Headers that cannot be encoded are skipped.
pub fn annotate(headers: &mut HeaderMap, verdict: &Verdict) {
    for (name, value) in verdict.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

/// Rate-limiting middleware. Returns 429 when the selected policy is
/// exhausted.
///
/// ```ignore
/// let app = Router::new()
///     .route("/api/digimons/mint", post(mint))
///     .layer(axum::middleware::from_fn_with_state(router, rate_limit));
/// ```
pub async fn rate_limit(
    State(router): State<Arc<PolicyRouter>>,
    mut req: Request,
    next: Next,
) -> Response {
    let info = RequestInfo::from_request(&req);

    let decision = match router.check(&info).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(error = %e, path = %info.path, "Rate limit check failed, allowing request");
            None
        }
    };

    if let Some(decision) = &decision {
        req.extensions_mut()
            .insert(AppliedPolicy(decision.policy.clone()));
    }

    match Action::from(decision) {
        Action::PassThrough => next.run(req).await,
        Action::Allow(verdict) => {
            let mut response = next.run(req).await;
            annotate(response.headers_mut(), &verdict);
            response
        }
        Action::Deny(denial) => {
            debug!(
                method = %info.method,
                path = %info.path,
                retry_after = denial.body.retry_after,
                "Request throttled"
            );
            denial.into_response()
        }
    }
}
