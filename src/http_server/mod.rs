//! # Module HTTP Server
//!
//! One axum server per module. Every path is prefixed with the module name.
//!
//! # Endpoints
//!
//! - `GET  /{module}/ws` - real-time gateway
//! - `POST /{module}/aggregate` - context aggregation (Bearer)
//! - `GET  /{module}/context` - module context (Bearer)
//! - `GET  /{module}/metrics` - module counters (Bearer)
//! - `GET  /{module}/health` - health check
//! - `POST /{module}/events` - event ingestion (Bearer)

pub mod errors;
pub mod routes;
pub mod server;
pub mod state;

pub use errors::{ApiError, ServerError};
pub use routes::{module_routes, parse_ingest_body};
pub use server::{shutdown_signal, ModuleServer, RELAY_GROUP};
pub use state::AppState;
