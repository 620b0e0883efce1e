//! Metrics registry
//!
//! - Counters only
//! - Monotonic increase
//! - Reset only on process start

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for one module server
///
/// # Thread Safety
///
/// All counters are atomics with Relaxed ordering; readers get an
/// eventually consistent view.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    events_appended: AtomicU64,
    events_acked: AtomicU64,
    events_retried: AtomicU64,
    events_dead_lettered: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    auth_failures: AtomicU64,
    broadcasts_delivered: AtomicU64,
    broadcasts_failed: AtomicU64,
    aggregations_ok: AtomicU64,
    aggregations_partial: AtomicU64,
    aggregations_failed: AtomicU64,
}

impl MetricsRegistry {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Event log

    pub fn increment_events_appended(&self) {
        self.events_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_acked(&self, count: u64) {
        self.events_acked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_events_retried(&self) {
        self.events_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_dead_lettered(&self) {
        self.events_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    // Gateway

    pub fn increment_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one broadcast
    pub fn record_broadcast(&self, delivered: u64, failed: u64) {
        self.broadcasts_delivered.fetch_add(delivered, Ordering::Relaxed);
        self.broadcasts_failed.fetch_add(failed, Ordering::Relaxed);
    }

    // Aggregation

    pub fn increment_aggregations_ok(&self) {
        self.aggregations_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_aggregations_partial(&self) {
        self.aggregations_partial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_aggregations_failed(&self) {
        self.aggregations_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_appended: self.events_appended.load(Ordering::Relaxed),
            events_acked: self.events_acked.load(Ordering::Relaxed),
            events_retried: self.events_retried.load(Ordering::Relaxed),
            events_dead_lettered: self.events_dead_lettered.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            broadcasts_delivered: self.broadcasts_delivered.load(Ordering::Relaxed),
            broadcasts_failed: self.broadcasts_failed.load(Ordering::Relaxed),
            aggregations_ok: self.aggregations_ok.load(Ordering::Relaxed),
            aggregations_partial: self.aggregations_partial.load(Ordering::Relaxed),
            aggregations_failed: self.aggregations_failed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_appended: u64,
    pub events_acked: u64,
    pub events_retried: u64,
    pub events_dead_lettered: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub auth_failures: u64,
    pub broadcasts_delivered: u64,
    pub broadcasts_failed: u64,
    pub aggregations_ok: u64,
    pub aggregations_partial: u64,
    pub aggregations_failed: u64,
}
