//! Apiguard - Pluggable API Rate Limiting
//!
//! This crate implements fixed-window rate limiting for HTTP API routes.
//! Requests are matched against an ordered route table to pick a policy;
//! each policy bucket lives either in a process-local store or in a shared
//! Redis-compatible store, keyed by client IP, IP and path, or bearer token.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod server;
