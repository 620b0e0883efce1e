//! Gateway lookup by module name, built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};
use super::gateway::Gateway;
use super::registry::BroadcastReport;

/// Gateways of the modules served by this process
///
/// The module server registers its gateway here at startup; the event relay
/// and shutdown reach gateways only through the directory.
#[derive(Default)]
pub struct GatewayDirectory {
    gateways: BTreeMap<String, Arc<Gateway>>,
}

impl GatewayDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, gateway: Arc<Gateway>) {
        self.gateways.insert(gateway.module().to_string(), gateway);
    }

    pub fn get(&self, module: &str) -> RealtimeResult<Arc<Gateway>> {
        self.gateways
            .get(module)
            .cloned()
            .ok_or_else(|| RealtimeError::UnknownModule(module.to_string()))
    }

    pub fn modules(&self) -> Vec<String> {
        self.gateways.keys().cloned().collect()
    }

    /// Push a context update through the gateway of `module`
    pub fn push_context_update(
        &self,
        module: &str,
        topic: &str,
        context: Value,
    ) -> RealtimeResult<BroadcastReport> {
        self.get(module)?.push_context_update(topic, context)
    }

    /// Push an event through the gateway of `module`
    pub fn push_event<T: Serialize>(
        &self,
        module: &str,
        topic: &str,
        event: &T,
    ) -> RealtimeResult<BroadcastReport> {
        self.get(module)?.push_event(topic, event)
    }

    /// Close every connection of every gateway
    pub fn close_all(&self, reason: &str) -> usize {
        self.gateways.values().map(|g| g.close_all(reason)).sum()
    }
}
