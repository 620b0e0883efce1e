//! # Observability
//!
//! - Structured logging through `tracing`
//! - Monotonic operational counters
//!
//! # Usage
//!
//! ```ignore
//! use ctxmesh::observability::{init_tracing, LogFormat, MetricsRegistry};
//!
//! init_tracing(LogFormat::Json);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.increment_events_appended();
//! ```

mod logging;
mod metrics;

pub use logging::{init_tracing, LogFormat};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
