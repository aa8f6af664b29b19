//! dynapm - a reverse proxy gateway that starts upstream services on demand
//!
//! This library provides a serverless-style gateway that:
//! - Routes HTTP and WebSocket traffic by hostname or dedicated listener port
//! - Runs a user-supplied shell command to start an offline service on its
//!   first request, health-gating forwarding until the upstream is reachable
//! - Shares one start across concurrent requests via a per-service
//!   single-flight
//! - Streams request and response bodies with backpressure and tracks
//!   active connections per service
//! - Bridges WebSocket sessions to ws/wss upstreams, queueing early frames
//! - Stops services whose idle window elapsed with no active connections
//! - Exposes an optional admin API guarded by an IP allowlist and a bearer
//!   token

pub mod admin;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod manager;
pub mod pool;
pub mod proxy;
pub mod reaper;
pub mod router;
pub mod service;
pub mod ws;
