//! # Context Aggregator
//!
//! Fans a query out to several modules concurrently, tolerates partial
//! failure and caches the shaped response for a short time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::client::ModuleClient;
use super::errors::{AggregateError, AggregateResult, ModuleError, ModuleFailure};
use super::merge::{select_context_by_priority, Aggregation, ModuleContext};
use super::module::ModuleDirectory;
use super::request::AggregateRequest;
use crate::cache::{Cache, AGGREGATE_TTL};
use crate::observability::MetricsRegistry;

/// Default per-module timeout
pub const DEFAULT_MODULE_TIMEOUT: Duration = Duration::from_secs(4);

/// Response of a successful aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResponse {
    pub query: String,
    pub aggregated: AggregatedContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedContext {
    /// Target modules in query order
    pub modules: Vec<String>,
    /// Selected context, see [`select_context_by_priority`]
    pub context: Value,
    pub priorities: BTreeMap<String, u8>,
    /// Completion time of each successful module
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
    pub errors: Vec<ModuleFailure>,
    pub metadata: AggregateMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetadata {
    pub total_modules: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub strategy: String,
    pub aggregated_at: DateTime<Utc>,
    pub latencies_ms: BTreeMap<String, u64>,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

impl AggregateResponse {
    /// Whether at least one target failed
    pub fn is_partial(&self) -> bool {
        !self.aggregated.errors.is_empty()
    }
}

/// Concurrent fan-out over module clients
pub struct ContextAggregator {
    directory: Arc<ModuleDirectory>,
    client: Arc<dyn ModuleClient>,
    cache: Arc<Cache>,
    metrics: Arc<MetricsRegistry>,
    timeout: Duration,
    cache_ttl: Duration,
}

impl ContextAggregator {
    pub fn new(
        directory: Arc<ModuleDirectory>,
        client: Arc<dyn ModuleClient>,
        cache: Arc<Cache>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            directory,
            client,
            cache,
            metrics,
            timeout: DEFAULT_MODULE_TIMEOUT,
            cache_ttl: AGGREGATE_TTL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn directory(&self) -> &ModuleDirectory {
        &self.directory
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Answer `request` by querying its target modules
    ///
    /// `token` is forwarded to every module. Fails only on validation or
    /// when every target failed.
    pub async fn aggregate(
        &self,
        request: &AggregateRequest,
        token: Option<&str>,
    ) -> AggregateResult<AggregateResponse> {
        let targets = request.resolve_targets(&self.directory)?;
        let cache_key = request.cache_key();

        if let Some(key) = &cache_key {
            if let Some(mut cached) = self.cache.get_json::<AggregateResponse>(key)? {
                debug!(key = %key, "Aggregation served from cache");
                cached.aggregated.metadata.cached = true;
                return Ok(cached);
            }
        }

        let aggregation = self.fan_out(&targets, &request.query, token, request).await;

        if aggregation.succeeded() == 0 {
            self.metrics.increment_aggregations_failed();
            warn!(
                query = %request.query,
                targets = targets.len(),
                "All target modules failed"
            );
            return Err(AggregateError::TotalFailure(aggregation.failures));
        }

        let response = self.shape(request, targets, aggregation, cache_key.clone());
        if response.is_partial() {
            self.metrics.increment_aggregations_partial();
        } else {
            self.metrics.increment_aggregations_ok();
        }

        if let Some(key) = &cache_key {
            self.cache.put_json(key, &response, self.cache_ttl)?;
        }
        Ok(response)
    }

    async fn fan_out(
        &self,
        targets: &[String],
        query: &str,
        token: Option<&str>,
        request: &AggregateRequest,
    ) -> Aggregation {
        let calls = targets.iter().map(|name| self.call_module(name, query, token));
        let results = join_all(calls).await;

        let mut contexts = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in targets.iter().zip(results) {
            match result {
                Ok(context) => contexts.push(context),
                Err((error, latency_ms)) => {
                    warn!(module = %name, error = %error, latency_ms, "Module call failed");
                    failures.push(ModuleFailure::new(name.as_str(), &error, latency_ms));
                }
            }
        }
        Aggregation::new(contexts, failures, request.strategy())
    }

    async fn call_module(
        &self,
        name: &str,
        query: &str,
        token: Option<&str>,
    ) -> Result<ModuleContext, (ModuleError, u64)> {
        let started = Instant::now();
        let descriptor = match self.directory.get(name) {
            Some(d) => d,
            None => return Err((ModuleError::Unavailable(format!("unknown module {}", name)), 0)),
        };

        let outcome = tokio::time::timeout(
            self.timeout,
            self.client.fetch_context(descriptor, query, token),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(data)) => Ok(ModuleContext {
                module: name.to_string(),
                data,
                priority: descriptor.priority,
                completed_at: Utc::now(),
                latency_ms,
            }),
            Ok(Err(e)) => Err((e, latency_ms)),
            Err(_) => Err((
                ModuleError::Timeout(self.timeout.as_millis() as u64),
                latency_ms,
            )),
        }
    }

    fn shape(
        &self,
        request: &AggregateRequest,
        targets: Vec<String>,
        aggregation: Aggregation,
        cache_key: Option<String>,
    ) -> AggregateResponse {
        let context = select_context_by_priority(&aggregation, request.preferred_module());

        let priorities = targets
            .iter()
            .map(|m| (m.clone(), self.directory.priority(m)))
            .collect();
        let timestamps = aggregation
            .contexts
            .iter()
            .map(|c| (c.module.clone(), c.completed_at))
            .collect();

        let mut latencies_ms: BTreeMap<String, u64> = aggregation
            .contexts
            .iter()
            .map(|c| (c.module.clone(), c.latency_ms))
            .collect();
        for failure in &aggregation.failures {
            latencies_ms.insert(failure.module.clone(), failure.latency_ms);
        }

        let metadata = AggregateMetadata {
            total_modules: targets.len(),
            succeeded: aggregation.succeeded(),
            failed: aggregation.failed(),
            strategy: request.strategy().as_str().to_string(),
            aggregated_at: Utc::now(),
            latencies_ms,
            cached: false,
            cache_key,
        };

        AggregateResponse {
            query: request.query.clone(),
            aggregated: AggregatedContext {
                modules: targets,
                context,
                priorities,
                timestamps,
                errors: aggregation.failures,
                metadata,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::client::StaticModuleClient;
    use crate::aggregator::request::MergeStrategy;
    use crate::cache::CacheConfig;
    use serde_json::json;

    fn aggregator(client: StaticModuleClient) -> (ContextAggregator, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let aggregator = ContextAggregator::new(
            Arc::new(ModuleDirectory::builtin("localhost")),
            Arc::new(client),
            Arc::new(Cache::new(CacheConfig::default())),
            Arc::clone(&metrics),
        )
        .with_timeout(Duration::from_millis(100));
        (aggregator, metrics)
    }

    #[tokio::test]
    async fn test_partial_failure_on_timeout() {
        let client = StaticModuleClient::new()
            .respond("finbot", json!({"context": {"balance": 100}}))
            .respond("mubot", json!({"ingested": 5}))
            .delay("dese", Duration::from_secs(5));
        let (aggregator, metrics) = aggregator(client);

        let request = AggregateRequest::new("status").with_modules(["finbot", "mubot", "dese"]);
        let response = aggregator.aggregate(&request, None).await.unwrap();

        let aggregated = &response.aggregated;
        assert_eq!(aggregated.context["finbot"]["balance"], 100);
        assert_eq!(aggregated.context["mubot"]["ingested"], 5);
        assert!(aggregated.context.get("dese").is_none());
        assert_eq!(aggregated.errors.len(), 1);
        assert_eq!(aggregated.errors[0].module, "dese");
        assert_eq!(aggregated.errors[0].code, "timeout");
        assert_eq!(aggregated.metadata.succeeded, 2);
        assert_eq!(aggregated.metadata.failed, 1);
        assert!(!aggregated.timestamps.contains_key("dese"));
        assert_eq!(metrics.snapshot().aggregations_partial, 1);
    }

    #[tokio::test]
    async fn test_total_failure() {
        let client = StaticModuleClient::new()
            .fail("finbot", ModuleError::Status(500))
            .fail("mubot", ModuleError::Unavailable("refused".into()));
        let (aggregator, metrics) = aggregator(client);

        let request = AggregateRequest::new("status").with_modules(["finbot", "mubot"]);
        match aggregator.aggregate(&request, None).await {
            Err(AggregateError::TotalFailure(failures)) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].code, "bad_status");
            }
            other => panic!("expected total failure, got {:?}", other),
        }
        assert_eq!(metrics.snapshot().aggregations_failed, 1);

        // a total failure is not cached
        let key = request.cache_key().unwrap();
        assert!(aggregator.cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_priority_selection_and_fallback() {
        let client = StaticModuleClient::new()
            .respond("finbot", json!({"balance": 100}))
            .fail("crm", ModuleError::Status(503));
        let (aggregator, _) = aggregator(client);

        let request = AggregateRequest::new("q")
            .with_modules(["finbot"])
            .with_priority("finbot");
        let response = aggregator.aggregate(&request, None).await.unwrap();
        assert_eq!(response.aggregated.context, json!({"balance": 100}));

        let request = AggregateRequest::new("q")
            .with_modules(["finbot"])
            .with_priority("crm");
        let response = aggregator.aggregate(&request, None).await.unwrap();
        assert_eq!(response.aggregated.modules, vec!["crm", "finbot"]);
        assert_eq!(response.aggregated.context["finbot"]["balance"], 100);
        assert_eq!(response.aggregated.priorities["crm"], 7);
    }

    #[tokio::test]
    async fn test_second_identical_request_is_cached() {
        let client = StaticModuleClient::new().respond("finbot", json!({"balance": 1}));
        let (aggregator, _) = aggregator(client);

        let request = AggregateRequest::new("q")
            .with_modules(["finbot"])
            .with_strategy(MergeStrategy::Priority);
        let first = aggregator.aggregate(&request, None).await.unwrap();
        assert!(!first.aggregated.metadata.cached);
        assert!(first.aggregated.metadata.cache_key.is_some());

        let second = aggregator.aggregate(&request, None).await.unwrap();
        assert!(second.aggregated.metadata.cached);
        assert_eq!(second.aggregated.context, json!({"balance": 1}));
    }

    #[tokio::test]
    async fn test_validation_rejected_before_fan_out() {
        let (aggregator, metrics) = aggregator(StaticModuleClient::new());
        let err = aggregator
            .aggregate(&AggregateRequest::new(""), None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(metrics.snapshot().aggregations_failed, 0);
    }
}
