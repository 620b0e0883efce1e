//! # Cache-Aside Layer
//!
//! TTL cache for module responses with stale-read fallback when a
//! refresh fails.

mod errors;
mod store;

pub use errors::{CacheError, CacheResult};
pub use store::{
    Cache, CacheConfig, CacheStats, AGGREGATE_TTL, CONTEXT_TTL, METRICS_TTL, QUERY_TTL,
};
