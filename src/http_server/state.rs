//! Shared state of one module server.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::aggregator::{builtin_topics, ContextAggregator};
use crate::auth::JwtManager;
use crate::cache::Cache;
use crate::event_log::{EventLog, EventLogResult};
use crate::observability::MetricsRegistry;
use crate::realtime::{Gateway, GatewayDirectory};

/// Recent events included in the module context
pub const CONTEXT_RECENT_EVENTS: usize = 20;

/// State handed to every route of a module server
#[derive(Clone)]
pub struct AppState {
    pub module: String,
    pub jwt: Arc<JwtManager>,
    pub gateway: Arc<Gateway>,
    pub gateways: Arc<GatewayDirectory>,
    pub aggregator: Arc<ContextAggregator>,
    pub log: Arc<EventLog>,
    pub cache: Arc<Cache>,
    pub metrics: Arc<MetricsRegistry>,
    pub started_at: Instant,
}

impl AppState {
    /// Stream that ingested events of this module land in
    pub fn events_stream(&self) -> String {
        format!("{}.events", self.module)
    }

    /// Context this module offers to aggregators
    ///
    /// Recent events of the module stream plus the stream and real-time
    /// state. `query` is echoed so callers can correlate.
    pub async fn module_context(&self, query: &str) -> EventLogResult<Value> {
        let stream = self.events_stream();
        let info = self.log.stream_info(&stream).await?;

        let window = info.as_ref().and_then(|i| i.first_offset.zip(i.last_offset));
        let recent = match window {
            Some((first, last)) => {
                let from = last
                    .saturating_sub(CONTEXT_RECENT_EVENTS as u64 - 1)
                    .max(first);
                self.log.range(&stream, from, CONTEXT_RECENT_EVENTS).await?
            }
            None => Vec::new(),
        };

        Ok(json!({
            "module": self.module,
            "query": query,
            "topics": builtin_topics(&self.module),
            "stream": info,
            "recentEvents": recent,
            "realtime": self.gateway.stats_json(),
        }))
    }

    /// Operational counters of this server
    pub fn module_metrics(&self) -> Value {
        json!({
            "module": self.module,
            "uptimeSecs": self.started_at.elapsed().as_secs(),
            "counters": self.metrics.snapshot(),
            "cache": self.cache.stats(),
            "realtime": self.gateway.stats_json(),
            "streams": self.log.streams(),
        })
    }
}
