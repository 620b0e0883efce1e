//! # Context Aggregation
//!
//! Answers one logical query by combining the context of several modules.
//!
//! - Targets are resolved against a [`ModuleDirectory`] built at startup
//! - Every target is called concurrently under its own timeout
//! - A failing module is reported in `errors`; the call only fails when
//!   every target failed
//! - Responses are cached briefly, keyed by a hash of the request body
//!
//! # Priority fallback
//!
//! When `priority` names a module that failed or was not queried, the
//! response `context` is the merged view of all successes instead of an
//! error. Callers asking for one module must check `errors` to tell the two
//! cases apart.

mod client;
mod errors;
mod merge;
mod module;
mod request;
mod service;

pub use client::{normalize_context, ContextFuture, HttpModuleClient, ModuleClient, StaticModuleClient};
pub use errors::{AggregateError, AggregateResult, ModuleError, ModuleFailure};
pub use merge::{merge_contexts, select_context_by_priority, Aggregation, ModuleContext};
pub use module::{builtin_topics, ModuleDescriptor, ModuleDirectory, BUILTIN_MODULES, DEFAULT_MODULES};
pub use request::{AggregateRequest, MergeStrategy, CACHEABLE_CONTEXT_KEYS, CACHE_KEY_PREFIX};
pub use service::{
    AggregateMetadata, AggregateResponse, AggregatedContext, ContextAggregator, DEFAULT_MODULE_TIMEOUT,
};
