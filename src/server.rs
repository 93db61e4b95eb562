//! HTTP server fronting the marketplace API routes with rate limiting.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path;
use axum::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use crate::error::{GuardError, Result};
use crate::middleware::{rate_limit, AppliedPolicy};
use crate::ratelimit::PolicyRouter;

/// Build the API router with the rate limit middleware applied.
///
/// The handlers are placeholders for the marketplace API; they exist so the
/// limiter can be exercised end to end.
pub fn app(limiter: Arc<PolicyRouter>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/api/auth/callback/{provider}", get(auth_callback).post(auth_callback))
        .route("/api/digimons", get(list_digimons))
        .route("/api/digimons/mint", post(mint))
        .route("/api/marketplace/{action}", post(marketplace_action))
        .fallback(not_found)
        .layer(axum::middleware::from_fn_with_state(limiter, rate_limit))
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_callback(Path(provider): Path<String>) -> Json<serde_json::Value> {
    Json(json!({ "provider": provider, "ok": true }))
}

/// Policy name for the response body; null when the request was not limited.
fn policy_name(applied: Option<Extension<AppliedPolicy>>) -> Option<String> {
    applied.map(|Extension(AppliedPolicy(name))| name)
}

async fn list_digimons(applied: Option<Extension<AppliedPolicy>>) -> Json<serde_json::Value> {
    Json(json!({ "items": [], "policy": policy_name(applied) }))
}

async fn mint(applied: Option<Extension<AppliedPolicy>>) -> Json<serde_json::Value> {
    Json(json!({ "minted": true, "policy": policy_name(applied) }))
}

async fn marketplace_action(
    Path(action): Path<String>,
    applied: Option<Extension<AppliedPolicy>>,
) -> Json<serde_json::Value> {
    Json(json!({ "action": action, "accepted": true, "policy": policy_name(applied) }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not Found" })))
}

/// HTTP server for the rate limited API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The policy router shared by all requests
    limiter: Arc<PolicyRouter>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiter: Arc<PolicyRouter>) -> Self {
        Self { addr, limiter }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "HTTP server listening");

        axum::serve(
            listener,
            app(self.limiter).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GuardError::Io(e)
        })
    }
}
