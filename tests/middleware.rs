//! End-to-end tests driving the API router through the rate limit middleware.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use tower::ServiceExt;

use apiguard::error::{GuardError, Result};
use apiguard::ratelimit::{
    CounterClient, LocalStorage, ManualClock, PolicyRouter, PolicyTable, SharedStorage, Storage,
    StorageBackends, StorageKind,
};
use apiguard::server::app;

const CLIENT_IP: &str = "203.0.113.7";

fn local_app() -> (Arc<ManualClock>, Router) {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let backends = StorageBackends::new(Arc::new(LocalStorage::with_clock(clock.clone())), None);
    let table = PolicyTable::marketplace(StorageKind::Local).unwrap();
    let limiter = PolicyRouter::with_clock(table, backends, clock.clone()).unwrap();
    (clock, app(Arc::new(limiter)))
}

fn request(method: Method, path: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn header<'a>(response: &'a Response, name: &str) -> &'a str {
    response.headers()[name].to_str().unwrap()
}

#[tokio::test]
async fn test_mint_limit_end_to_end() {
    let (clock, app) = local_app();

    for expected_remaining in ["4", "3", "2", "1", "0"] {
        let response = send(&app, request(Method::POST, "/api/digimons/mint", CLIENT_IP)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "5");
        assert_eq!(header(&response, "x-ratelimit-remaining"), expected_remaining);
        assert_eq!(header(&response, "x-ratelimit-reset"), "1700000060");
        clock.advance(2);
    }

    let response = send(&app, request(Method::POST, "/api/digimons/mint", CLIENT_IP)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "retry-after"), "50");

    let body = json_body(response).await;
    assert_eq!(body["error"], "Too Many Requests");
    assert!(body["message"].as_str().unwrap().contains("mint"));
    let retry_after = body["retryAfter"].as_u64().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    clock.advance(61);
    let response = send(&app, request(Method::POST, "/api/digimons/mint", CLIENT_IP)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "4");
}

#[tokio::test]
async fn test_handlers_see_applied_policy() {
    let (_clock, app) = local_app();

    let response = send(&app, request(Method::POST, "/api/digimons/mint", CLIENT_IP)).await;
    assert_eq!(json_body(response).await["policy"], "mint");

    let response = send(&app, request(Method::GET, "/api/digimons", CLIENT_IP)).await;
    assert_eq!(json_body(response).await["policy"], "read");

    let response = send(&app, request(Method::POST, "/api/marketplace/sell", CLIENT_IP)).await;
    let body = json_body(response).await;
    assert_eq!(body["action"], "sell");
    assert_eq!(body["policy"], "marketplace");
}

#[tokio::test]
async fn test_denied_request_skips_handler() {
    let (_clock, app) = local_app();

    for _ in 0..5 {
        send(&app, request(Method::POST, "/api/digimons/mint", CLIENT_IP)).await;
    }
    let response = send(&app, request(Method::POST, "/api/digimons/mint", CLIENT_IP)).await;
    let body = json_body(response).await;

    assert!(body.get("minted").is_none());
}

#[tokio::test]
async fn test_other_clients_unaffected() {
    let (_clock, app) = local_app();

    for _ in 0..6 {
        send(&app, request(Method::POST, "/api/digimons/mint", CLIENT_IP)).await;
    }

    let response = send(&app, request(Method::POST, "/api/digimons/mint", "198.51.100.20")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "4");
}

#[tokio::test]
async fn test_auth_callback_always_passes() {
    let (_clock, app) = local_app();

    for _ in 0..200 {
        let response = send(
            &app,
            request(Method::POST, "/api/auth/callback/credentials", CLIENT_IP),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn test_non_api_paths_are_not_limited() {
    let (_clock, app) = local_app();

    let response = send(&app, request(Method::GET, "/health", CLIENT_IP)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
}

#[tokio::test]
async fn test_read_policy_budgets_per_path() {
    let (_clock, app) = local_app();

    let response = send(&app, request(Method::GET, "/api/digimons", CLIENT_IP)).await;
    assert_eq!(header(&response, "x-ratelimit-limit"), "100");
    assert_eq!(header(&response, "x-ratelimit-remaining"), "99");

    let response = send(&app, request(Method::GET, "/api/digimons", CLIENT_IP)).await;
    assert_eq!(header(&response, "x-ratelimit-remaining"), "98");

    // Unknown route, own bucket, still annotated on the 404.
    let response = send(&app, request(Method::GET, "/api/unknown", CLIENT_IP)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "99");
}

#[tokio::test]
async fn test_marketplace_keyed_by_bearer_token() {
    let (_clock, app) = local_app();

    let with_token = |token: &str| {
        Request::builder()
            .method(Method::POST)
            .uri("/api/marketplace/buy")
            .header("x-forwarded-for", CLIENT_IP)
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..10 {
        let response = send(&app, with_token("alice")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = send(&app, with_token("alice")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Same IP, different credential: separate bucket.
    let response = send(&app, with_token("bob")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "9");

    // No credential: falls back to the IP bucket, which is still fresh.
    let response = send(&app, request(Method::POST, "/api/marketplace/buy", CLIENT_IP)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "9");
}

/// A shared store whose server is always down.
struct DownClient;

#[async_trait]
impl CounterClient for DownClient {
    async fn incr_window(&self, _key: &str, _window_secs: u64) -> Result<u64> {
        Err(GuardError::Storage("connection refused".to_string()))
    }

    async fn ttl(&self, _key: &str) -> Result<i64> {
        Err(GuardError::Storage("connection refused".to_string()))
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Err(GuardError::Storage("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_shared_store_outage_fails_open() {
    let shared: Arc<dyn Storage> = Arc::new(SharedStorage::with_client(DownClient));
    let backends = StorageBackends::new(Arc::new(LocalStorage::new()), Some(shared));
    let table = PolicyTable::marketplace(StorageKind::Shared).unwrap();
    let app = app(Arc::new(PolicyRouter::new(table, backends).unwrap()));

    // Far beyond the mint limit of 5; every request must still go through.
    for _ in 0..50 {
        let response = send(&app, request(Method::POST, "/api/digimons/mint", CLIENT_IP)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-remaining"), "4");
    }
}
