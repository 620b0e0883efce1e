//! # Aggregation Request
//!
//! Request body, validation, target resolution and cache keying.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::errors::{AggregateError, AggregateResult};
use super::module::ModuleDirectory;

/// Prefix of aggregated response cache keys
pub const CACHE_KEY_PREFIX: &str = "ctxmesh:aggregated:";

/// `context` keys that do not make a request caller-specific
pub const CACHEABLE_CONTEXT_KEYS: [&str; 4] = ["type", "scope", "period", "timeRange"];

/// How successful module results are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// `{module: data}` for every success
    #[default]
    Merge,
    /// Data of the highest-priority success
    Priority,
    /// Data of the most recently completed success
    Latest,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Merge => "merge",
            MergeStrategy::Priority => "priority",
            MergeStrategy::Latest => "latest",
        }
    }
}

/// Body of `POST /{module}/aggregate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

impl AggregateRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            modules: None,
            priority: None,
            merge_strategy: None,
            context: None,
        }
    }

    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules = Some(modules.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = Some(strategy);
        self
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.merge_strategy.unwrap_or_default()
    }

    /// Module named by `priority`, `None` for `"auto"` or absent
    pub fn preferred_module(&self) -> Option<&str> {
        self.priority
            .as_deref()
            .filter(|p| !p.is_empty() && *p != "auto")
    }

    /// Check the request and resolve the modules to query
    ///
    /// Explicit modules win over the directory defaults. Duplicates are
    /// dropped keeping the first occurrence; a named priority module is
    /// moved to the front, and added when missing.
    pub fn resolve_targets(&self, directory: &ModuleDirectory) -> AggregateResult<Vec<String>> {
        if self.query.trim().is_empty() {
            return Err(AggregateError::EmptyQuery);
        }

        let requested: Vec<String> = match &self.modules {
            Some(modules) if !modules.is_empty() => modules.clone(),
            _ => directory.defaults().to_vec(),
        };

        let mut targets: Vec<String> = Vec::with_capacity(requested.len() + 1);
        if let Some(preferred) = self.preferred_module() {
            targets.push(preferred.to_string());
        }
        for module in requested {
            if !targets.contains(&module) {
                targets.push(module);
            }
        }

        for module in &targets {
            if !directory.contains(module) {
                return Err(AggregateError::UnknownModule(module.clone()));
            }
        }
        Ok(targets)
    }

    /// Whether the response may be cached
    pub fn is_cacheable(&self) -> bool {
        match &self.context {
            None => true,
            Some(context) => context
                .keys()
                .all(|k| CACHEABLE_CONTEXT_KEYS.contains(&k.as_str())),
        }
    }

    /// SHA-256 cache key of the canonical request body
    ///
    /// `None` when `context` carries caller-specific keys.
    pub fn cache_key(&self) -> Option<String> {
        if !self.is_cacheable() {
            return None;
        }
        // serde_json maps are key-ordered, so equal requests encode equally
        let canonical = serde_json::to_vec(self).ok()?;
        let digest = Sha256::digest(&canonical);
        Some(format!("{}{}", CACHE_KEY_PREFIX, hex::encode(digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn directory() -> ModuleDirectory {
        ModuleDirectory::builtin("localhost")
    }

    #[test]
    fn test_defaults_when_no_modules() {
        let targets = AggregateRequest::new("cash position")
            .resolve_targets(&directory())
            .unwrap();
        assert_eq!(targets, vec!["finbot", "mubot", "dese", "observability"]);
    }

    #[test]
    fn test_priority_moves_to_front() {
        let request = AggregateRequest::new("q")
            .with_modules(["finbot", "dese", "crm"])
            .with_priority("crm");
        assert_eq!(
            request.resolve_targets(&directory()).unwrap(),
            vec!["crm", "finbot", "dese"]
        );

        let request = AggregateRequest::new("q")
            .with_modules(["finbot"])
            .with_priority("hr");
        assert_eq!(
            request.resolve_targets(&directory()).unwrap(),
            vec!["hr", "finbot"]
        );
    }

    #[test]
    fn test_auto_priority_keeps_order() {
        let request = AggregateRequest::new("q")
            .with_modules(["mubot", "finbot", "mubot"])
            .with_priority("auto");
        assert_eq!(
            request.resolve_targets(&directory()).unwrap(),
            vec!["mubot", "finbot"]
        );
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            AggregateRequest::new("  ").resolve_targets(&directory()),
            Err(AggregateError::EmptyQuery)
        ));
        assert!(matches!(
            AggregateRequest::new("q")
                .with_modules(["finbot", "payroll"])
                .resolve_targets(&directory()),
            Err(AggregateError::UnknownModule(m)) if m == "payroll"
        ));
    }

    #[test]
    fn test_cache_key_stable_and_allow_listed() {
        let a: AggregateRequest = serde_json::from_value(json!({
            "query": "q",
            "context": {"scope": "org", "period": "month"}
        }))
        .unwrap();
        let b: AggregateRequest = serde_json::from_value(json!({
            "context": {"period": "month", "scope": "org"},
            "query": "q"
        }))
        .unwrap();
        let key = a.cache_key().unwrap();
        assert!(key.starts_with(CACHE_KEY_PREFIX));
        assert_eq!(Some(key), b.cache_key());

        let personal: AggregateRequest = serde_json::from_value(json!({
            "query": "q",
            "context": {"userId": "u-1"}
        }))
        .unwrap();
        assert!(personal.cache_key().is_none());
    }

    #[test]
    fn test_strategy_parsing() {
        let request: AggregateRequest =
            serde_json::from_value(json!({"query": "q", "mergeStrategy": "latest"})).unwrap();
        assert_eq!(request.strategy(), MergeStrategy::Latest);
        assert!(serde_json::from_value::<AggregateRequest>(
            json!({"query": "q", "mergeStrategy": "random"})
        )
        .is_err());
    }
}
