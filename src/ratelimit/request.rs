//! Request descriptor consumed by the rate limiter.
//!
//! The limiter never sees a full HTTP request. It works from the handful
//! of fields it needs: method, path, headers, cookies and the peer address.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request};

/// The parts of an inbound request that rate limiting depends on.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// HTTP method
    pub method: Method,
    /// URL path, without query string
    pub path: String,
    /// Request headers (case-insensitive lookup)
    pub headers: HeaderMap,
    /// Address of the directly connected peer, when known
    pub peer_ip: Option<IpAddr>,
}

impl RequestInfo {
    /// Create a descriptor with no headers.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            peer_ip: None,
        }
    }

    /// Build a descriptor from an HTTP request.
    ///
    /// The peer address is taken from axum's `ConnectInfo` extension when the
    /// server was started with connect info enabled.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            headers: req.headers().clone(),
            peer_ip,
        }
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Set the peer address.
    pub fn with_peer_ip(mut self, ip: IpAddr) -> Self {
        self.peer_ip = Some(ip);
        self
    }

    /// Look up a header value as a string.
    ///
    /// Returns `None` when the header is missing or not valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Look up a cookie by name across all `cookie` headers.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(axum::http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim() == name)
            .map(|(_, v)| v.trim())
    }
}
