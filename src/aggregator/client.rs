//! # Module Clients
//!
//! Transport used by the aggregator to fetch one module's context.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::{json, Map, Value};

use super::errors::ModuleError;
use super::module::ModuleDescriptor;

/// Boxed future returned by [`ModuleClient::fetch_context`]
pub type ContextFuture<'a> = Pin<Box<dyn Future<Output = Result<Map<String, Value>, ModuleError>> + Send + 'a>>;

/// Fetches the context of one module for a query
pub trait ModuleClient: Send + Sync {
    fn fetch_context<'a>(
        &'a self,
        module: &'a ModuleDescriptor,
        query: &'a str,
        token: Option<&'a str>,
    ) -> ContextFuture<'a>;
}

/// Reduce a module response to a JSON object
///
/// Looks for `response.context`, then `response`, then `context`, then the
/// body itself. Anything that is not an object is wrapped as `{value}`.
pub fn normalize_context(body: Value) -> Map<String, Value> {
    let mut body = body;
    let inner = if body.pointer("/response/context").is_some() {
        body.pointer_mut("/response/context").map(Value::take)
    } else if body.get("response").is_some() {
        body.get_mut("response").map(Value::take)
    } else if body.get("context").is_some() {
        body.get_mut("context").map(Value::take)
    } else {
        None
    };

    match inner.unwrap_or(body) {
        Value::Object(map) => map,
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), other);
            wrapped
        }
    }
}

/// HTTP client for module servers
///
/// Calls `GET {base_url}/{module}/context?query=` and forwards the caller's
/// bearer token.
#[derive(Debug, Clone)]
pub struct HttpModuleClient {
    http: reqwest::Client,
}

impl HttpModuleClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, ModuleError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ModuleError::Unavailable(e.to_string()))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ModuleClient for HttpModuleClient {
    fn fetch_context<'a>(
        &'a self,
        module: &'a ModuleDescriptor,
        query: &'a str,
        token: Option<&'a str>,
    ) -> ContextFuture<'a> {
        Box::pin(async move {
            let mut request = self
                .http
                .get(module.context_url())
                .query(&[("query", query)]);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ModuleError::Unavailable(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ModuleError::Status(status.as_u16()));
            }

            let body: Value = response
                .json()
                .await
                .map_err(|e| ModuleError::InvalidResponse(e.to_string()))?;
            Ok(normalize_context(body))
        })
    }
}

/// Client that serves fixed results, for wiring without a network
#[derive(Debug, Clone, Default)]
pub struct StaticModuleClient {
    responses: std::collections::BTreeMap<String, Result<Value, ModuleError>>,
    delays: std::collections::BTreeMap<String, Duration>,
}

impl StaticModuleClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, module: &str, body: Value) -> Self {
        self.responses.insert(module.to_string(), Ok(body));
        self
    }

    pub fn fail(mut self, module: &str, error: ModuleError) -> Self {
        self.responses.insert(module.to_string(), Err(error));
        self
    }

    pub fn delay(mut self, module: &str, delay: Duration) -> Self {
        self.delays.insert(module.to_string(), delay);
        self
    }
}

impl ModuleClient for StaticModuleClient {
    fn fetch_context<'a>(
        &'a self,
        module: &'a ModuleDescriptor,
        query: &'a str,
        _token: Option<&'a str>,
    ) -> ContextFuture<'a> {
        Box::pin(async move {
            if let Some(delay) = self.delays.get(&module.name) {
                tokio::time::sleep(*delay).await;
            }
            match self.responses.get(&module.name) {
                Some(Ok(body)) => Ok(normalize_context(body.clone())),
                Some(Err(e)) => Err(e.clone()),
                None => Ok(normalize_context(json!({"module": module.name, "query": query}))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefers_nested_context() {
        let map = normalize_context(json!({"response": {"context": {"a": 1}, "other": 2}}));
        assert_eq!(Value::Object(map), json!({"a": 1}));

        let map = normalize_context(json!({"module": "finbot", "context": {"b": 2}}));
        assert_eq!(Value::Object(map), json!({"b": 2}));

        let map = normalize_context(json!({"c": 3}));
        assert_eq!(Value::Object(map), json!({"c": 3}));
    }

    #[test]
    fn test_normalize_wraps_non_objects() {
        assert_eq!(Value::Object(normalize_context(json!([1, 2]))), json!({"value": [1, 2]}));
        assert_eq!(
            Value::Object(normalize_context(json!({"response": "ok"}))),
            json!({"value": "ok"})
        );
    }

    #[tokio::test]
    async fn test_static_client() {
        let client = StaticModuleClient::new()
            .respond("finbot", json!({"balance": 1}))
            .fail("dese", ModuleError::Status(500));
        let finbot = ModuleDescriptor::new("finbot", "http://localhost:5555", 9);
        let dese = ModuleDescriptor::new("dese", "http://localhost:5557", 1);

        let ok = client.fetch_context(&finbot, "q", None).await.unwrap();
        assert_eq!(ok["balance"], 1);
        assert_eq!(
            client.fetch_context(&dese, "q", None).await,
            Err(ModuleError::Status(500))
        );
    }
}
