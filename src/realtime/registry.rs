//! # Subscription Registry
//!
//! Connection table and topic index of one gateway.
//!
//! Both maps live behind one `RwLock`. Mutations take the write lock;
//! broadcast picks its targets and enqueues under the read lock. Since
//! enqueueing is a non-blocking channel send, an unsubscribe that has
//! returned is never followed by delivery of a later broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::sync::mpsc;

use super::connection::{
    new_connection_id, Connection, ConnectionInfo, ConnectionState, Outbound, OutboundReceiver,
};
use super::errors::{RealtimeError, RealtimeResult};
use crate::auth::Identity;

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Authenticated subscribers at call time
    pub matched: usize,
    /// Messages enqueued
    pub delivered: usize,
    /// Subscribers whose outbound channel was closed
    pub failed: usize,
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connected_clients: usize,
    pub authenticated_clients: usize,
    pub topics: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<String, Connection>,
    topics: HashMap<String, HashSet<String>>,
}

/// Topic to connection index for one module
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RealtimeResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| RealtimeError::Internal("registry lock poisoned".into()))
    }

    fn write(&self) -> RealtimeResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| RealtimeError::Internal("registry lock poisoned".into()))
    }

    /// Register a new unauthenticated connection
    pub fn register(&self, module: &str) -> RealtimeResult<(String, OutboundReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = new_connection_id(module);
        let mut inner = self.write()?;
        inner
            .connections
            .insert(id.clone(), Connection::new(id.clone(), module, tx));
        Ok((id, rx))
    }

    /// Mark a connection authenticated
    ///
    /// Authentication happens once; a second call is rejected and leaves
    /// the recorded identity unchanged.
    pub fn authenticate(&self, connection_id: &str, identity: Identity) -> RealtimeResult<()> {
        let mut inner = self.write()?;
        let conn = inner
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RealtimeError::ConnectionNotFound(connection_id.to_string()))?;
        if conn.is_authenticated() {
            return Err(RealtimeError::AlreadyAuthenticated);
        }
        conn.state = ConnectionState::Authenticated;
        conn.identity = Some(identity);
        Ok(())
    }

    pub fn is_authenticated(&self, connection_id: &str) -> bool {
        self.read()
            .map(|inner| {
                inner
                    .connections
                    .get(connection_id)
                    .map(Connection::is_authenticated)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Add `connection_id` to the subscribers of `topic`
    ///
    /// `topic` is the qualified `module:topic` key.
    pub fn subscribe(&self, connection_id: &str, topic: &str) -> RealtimeResult<()> {
        let mut inner = self.write()?;
        let conn = inner
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RealtimeError::ConnectionNotFound(connection_id.to_string()))?;
        if !conn.is_authenticated() {
            return Err(RealtimeError::AuthenticationRequired);
        }
        conn.topics.insert(topic.to_string());
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id.to_string());
        Ok(())
    }

    /// Remove `connection_id` from `topic`; returns whether it was subscribed
    pub fn unsubscribe(&self, connection_id: &str, topic: &str) -> RealtimeResult<bool> {
        let mut inner = self.write()?;
        let conn = inner
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RealtimeError::ConnectionNotFound(connection_id.to_string()))?;
        if !conn.is_authenticated() {
            return Err(RealtimeError::AuthenticationRequired);
        }
        let was_subscribed = conn.topics.remove(topic);

        if let Some(subscribers) = inner.topics.get_mut(topic) {
            subscribers.remove(connection_id);
            if subscribers.is_empty() {
                inner.topics.remove(topic);
            }
        }
        Ok(was_subscribed)
    }

    /// Drop a connection and all of its subscriptions
    pub fn remove(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let mut inner = self.write().ok()?;
        let conn = inner.connections.remove(connection_id)?;
        for topic in &conn.topics {
            if let Some(subscribers) = inner.topics.get_mut(topic) {
                subscribers.remove(connection_id);
                if subscribers.is_empty() {
                    inner.topics.remove(topic);
                }
            }
        }
        Some(conn.snapshot())
    }

    /// Queue a frame for one connection; false if it is gone
    pub fn send_to(&self, connection_id: &str, frame: Outbound) -> bool {
        match self.read() {
            Ok(inner) => inner
                .connections
                .get(connection_id)
                .map(|c| c.sender.send(frame).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Queue `text` for every authenticated subscriber of `topic`
    pub fn broadcast(&self, topic: &str, text: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Ok(inner) = self.read() else {
            return report;
        };
        let Some(subscribers) = inner.topics.get(topic) else {
            return report;
        };

        for id in subscribers {
            let Some(conn) = inner.connections.get(id) else {
                continue;
            };
            if !conn.is_authenticated() {
                continue;
            }
            report.matched += 1;
            if conn.sender.send(Outbound::Text(text.to_string())).is_ok() {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Queue a frame for every connection
    pub fn send_all(&self, frame: Outbound) -> usize {
        match self.read() {
            Ok(inner) => inner
                .connections
                .values()
                .filter(|c| c.sender.send(frame.clone()).is_ok())
                .count(),
            Err(_) => 0,
        }
    }

    /// Connection ids subscribed to `topic`, sorted
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .map(|inner| {
                inner
                    .topics
                    .get(topic)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.read()
            .ok()?
            .connections
            .get(connection_id)
            .map(Connection::snapshot)
    }

    pub fn stats(&self) -> RegistryStats {
        match self.read() {
            Ok(inner) => RegistryStats {
                connected_clients: inner.connections.len(),
                authenticated_clients: inner
                    .connections
                    .values()
                    .filter(|c| c.is_authenticated())
                    .count(),
                topics: inner.topics.len(),
                subscriptions: inner.topics.values().map(HashSet::len).sum(),
            },
            Err(_) => RegistryStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            user_id: "u-1".into(),
            email: "ana@example.com".into(),
            role: "analyst".into(),
        }
    }

    fn authenticated(registry: &SubscriptionRegistry) -> (String, OutboundReceiver) {
        let (id, rx) = registry.register("finbot").unwrap();
        registry.authenticate(&id, identity()).unwrap();
        (id, rx)
    }

    #[test]
    fn test_unauthenticated_cannot_subscribe() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx) = registry.register("finbot").unwrap();

        let result = registry.subscribe(&id, "finbot:accounts");
        assert!(matches!(result, Err(RealtimeError::AuthenticationRequired)));
        assert!(registry.subscribers("finbot:accounts").is_empty());
    }

    #[test]
    fn test_authenticate_once() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx) = authenticated(&registry);

        let other = Identity {
            user_id: "u-2".into(),
            ..identity()
        };
        assert!(matches!(
            registry.authenticate(&id, other),
            Err(RealtimeError::AlreadyAuthenticated)
        ));
        let info = registry.connection(&id).unwrap();
        assert_eq!(info.identity.unwrap().user_id, "u-1");
    }

    #[test]
    fn test_broadcast_reaches_subscribers_only() {
        let registry = SubscriptionRegistry::new();
        let (a, mut rx_a) = authenticated(&registry);
        let (_b, mut rx_b) = authenticated(&registry);
        registry.subscribe(&a, "finbot:accounts").unwrap();

        let report = registry.broadcast("finbot:accounts", "hello");
        assert_eq!(
            report,
            BroadcastReport {
                matched: 1,
                delivered: 1,
                failed: 0
            }
        );
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Text("hello".into()));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_no_delivery_after_unsubscribe() {
        let registry = SubscriptionRegistry::new();
        let (a, mut rx) = authenticated(&registry);
        registry.subscribe(&a, "finbot:accounts").unwrap();
        assert!(registry.unsubscribe(&a, "finbot:accounts").unwrap());

        let report = registry.broadcast("finbot:accounts", "late");
        assert_eq!(report.matched, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.stats().topics, 0);
    }

    #[test]
    fn test_closed_channel_counts_as_failure() {
        let registry = SubscriptionRegistry::new();
        let (a, rx_a) = authenticated(&registry);
        let (b, mut rx_b) = authenticated(&registry);
        registry.subscribe(&a, "finbot:accounts").unwrap();
        registry.subscribe(&b, "finbot:accounts").unwrap();
        drop(rx_a);

        let report = registry.broadcast("finbot:accounts", "x");
        assert_eq!(report.matched, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_remove_clears_every_topic() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx) = authenticated(&registry);
        registry.subscribe(&a, "finbot:accounts").unwrap();
        registry.subscribe(&a, "finbot:budgets").unwrap();

        let removed = registry.remove(&a).unwrap();
        assert_eq!(removed.topics.len(), 2);
        assert!(registry.subscribers("finbot:accounts").is_empty());
        assert!(registry.subscribers("finbot:budgets").is_empty());
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn test_stats() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = authenticated(&registry);
        let (_b, _rx_b) = registry.register("finbot").unwrap();
        registry.subscribe(&a, "finbot:accounts").unwrap();

        let stats = registry.stats();
        assert_eq!(stats.connected_clients, 2);
        assert_eq!(stats.authenticated_clients, 1);
        assert_eq!(stats.topics, 1);
        assert_eq!(stats.subscriptions, 1);
    }
}
