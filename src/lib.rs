//! ctxmesh - real-time context and event distribution for module servers
//!
//! Each module server combines:
//! - a durable event log with consumer groups ([`event_log`])
//! - an authenticated WebSocket gateway with topic subscriptions ([`realtime`])
//! - a cross-module context aggregator with caching ([`aggregator`])

pub mod aggregator;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod event_log;
pub mod http_server;
pub mod naming;
pub mod observability;
pub mod realtime;
