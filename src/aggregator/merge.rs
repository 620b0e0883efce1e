//! # Context Merge
//!
//! Combines successful module results and picks the response context.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::errors::ModuleFailure;
use super::request::MergeStrategy;

/// Successful result of one module
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleContext {
    pub module: String,
    pub data: Map<String, Value>,
    pub priority: u8,
    pub completed_at: DateTime<Utc>,
    pub latency_ms: u64,
}

/// Fan-out results before they are shaped into a response
#[derive(Debug, Clone)]
pub struct Aggregation {
    /// Successes in target order
    pub contexts: Vec<ModuleContext>,
    /// Failures in target order
    pub failures: Vec<ModuleFailure>,
    /// Output of the merge strategy
    pub merged: Map<String, Value>,
}

impl Aggregation {
    pub fn new(contexts: Vec<ModuleContext>, failures: Vec<ModuleFailure>, strategy: MergeStrategy) -> Self {
        let merged = merge_contexts(&contexts, strategy);
        Self {
            contexts,
            failures,
            merged,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.contexts.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn context_of(&self, module: &str) -> Option<&ModuleContext> {
        self.contexts.iter().find(|c| c.module == module)
    }
}

/// Merge module results according to `strategy`
///
/// Ties under `priority` and `latest` go to the module earlier in the
/// target list.
pub fn merge_contexts(contexts: &[ModuleContext], strategy: MergeStrategy) -> Map<String, Value> {
    match strategy {
        MergeStrategy::Merge => contexts
            .iter()
            .map(|c| (c.module.clone(), Value::Object(c.data.clone())))
            .collect(),
        MergeStrategy::Priority => contexts
            .iter()
            .rev()
            .max_by_key(|c| c.priority)
            .map(|c| c.data.clone())
            .unwrap_or_default(),
        MergeStrategy::Latest => contexts
            .iter()
            .rev()
            .max_by_key(|c| c.completed_at)
            .map(|c| c.data.clone())
            .unwrap_or_default(),
    }
}

/// Context returned to the caller
///
/// The preferred module's data when that module succeeded, else the merged
/// view. A failed or absent preferred module falls back to the merged view
/// rather than failing the request.
pub fn select_context_by_priority(aggregation: &Aggregation, preferred: Option<&str>) -> Value {
    if let Some(context) = preferred.and_then(|module| aggregation.context_of(module)) {
        return Value::Object(context.data.clone());
    }
    Value::Object(aggregation.merged.clone())
}
