//! # Events
//!
//! Domain events carried by streams, validated at the log boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::{EventLogError, EventLogResult};
use crate::naming::is_valid_name;

/// Metadata key holding the retry counter set by the consumer worker
pub const RETRY_COUNT_KEY: &str = "retryCount";

/// Largest accepted event, as serialized JSON
///
/// Leaves room below the journal record limit for the op envelope and the
/// metadata retries and dead-lettering add.
pub const MAX_EVENT_BYTES: usize = 8 * 1024 * 1024;

/// Domain event
///
/// `id` is assigned by the producer and is the idempotency key for
/// consumers. The log assigns its own stream offset on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Producer-assigned identifier
    pub id: String,

    /// Event type, e.g. `finbot.transaction.created`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Producing module
    pub source: String,

    /// RFC 3339 timestamp
    pub timestamp: String,

    /// Producer status code
    #[serde(default)]
    pub status: i64,

    /// Producer-side processing time
    #[serde(default)]
    pub processing_time_ms: f64,

    /// Event payload
    #[serde(default)]
    pub data: Value,

    /// Optional string metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Event {
    /// Create an event with a fresh UUID and the current time
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), event_type, source, data)
    }

    /// Create an event with an explicit producer id
    pub fn with_id(
        id: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            status: 0,
            processing_time_ms: 0.0,
            data,
            metadata: None,
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_metadata(key, value);
        self
    }

    /// Set a metadata entry in place
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// Look up a metadata entry
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }

    /// Number of times the consumer worker has re-queued this event
    pub fn retry_count(&self) -> u32 {
        self.metadata_value(RETRY_COUNT_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Parsed timestamp
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Validate the event shape
    pub fn validate(&self) -> EventLogResult<()> {
        if self.id.trim().is_empty() {
            return Err(EventLogError::InvalidEvent("id must not be empty".into()));
        }
        if !is_valid_name(&self.event_type) {
            return Err(EventLogError::InvalidEvent(format!(
                "type '{}' is not a valid event type",
                self.event_type
            )));
        }
        if !is_valid_name(&self.source) {
            return Err(EventLogError::InvalidEvent(format!(
                "source '{}' is not a valid module name",
                self.source
            )));
        }
        if self.parsed_timestamp().is_none() {
            return Err(EventLogError::InvalidEvent(format!(
                "timestamp '{}' is not RFC 3339",
                self.timestamp
            )));
        }
        if !self.processing_time_ms.is_finite() || self.processing_time_ms < 0.0 {
            return Err(EventLogError::InvalidEvent(
                "processingTimeMs must be a non-negative number".into(),
            ));
        }
        let size = serde_json::to_vec(self)
            .map_err(|e| EventLogError::InvalidEvent(e.to_string()))?
            .len();
        if size > MAX_EVENT_BYTES {
            return Err(EventLogError::InvalidEvent(format!(
                "event is {} bytes, limit is {}",
                size, MAX_EVENT_BYTES
            )));
        }
        Ok(())
    }

    /// Parse an arbitrary JSON value into a validated event
    pub fn parse(value: Value) -> EventLogResult<Self> {
        let event: Event = serde_json::from_value(value)
            .map_err(|e| EventLogError::InvalidEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Encode as a flat field list
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("type".to_string(), self.event_type.clone()),
            ("source".to_string(), self.source.clone()),
            ("timestamp".to_string(), self.timestamp.clone()),
            ("status".to_string(), self.status.to_string()),
            (
                "processingTimeMs".to_string(),
                self.processing_time_ms.to_string(),
            ),
            ("data".to_string(), self.data.to_string()),
        ];
        if let Some(metadata) = &self.metadata {
            // BTreeMap<String, String> always serializes
            let encoded = serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string());
            fields.push(("metadata".to_string(), encoded));
        }
        fields
    }

    /// Decode and validate a flat field list
    pub fn from_fields(fields: &BTreeMap<String, String>) -> EventLogResult<Self> {
        let required = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| EventLogError::InvalidEvent(format!("missing field '{}'", name)))
        };

        let data = serde_json::from_str(&required("data")?)
            .map_err(|e| EventLogError::InvalidEvent(format!("data is not JSON: {}", e)))?;

        let status = match fields.get("status") {
            Some(raw) => raw
                .parse()
                .map_err(|_| EventLogError::InvalidEvent(format!("status '{}' is not an integer", raw)))?,
            None => 0,
        };

        let processing_time_ms = match fields.get("processingTimeMs") {
            Some(raw) => raw.parse().map_err(|_| {
                EventLogError::InvalidEvent(format!("processingTimeMs '{}' is not a number", raw))
            })?,
            None => 0.0,
        };

        let metadata = match fields.get("metadata") {
            Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
                EventLogError::InvalidEvent(format!("metadata is not a string map: {}", e))
            })?),
            None => None,
        };

        let event = Event {
            id: required("id")?,
            event_type: required("type")?,
            source: required("source")?,
            timestamp: required("timestamp")?,
            status,
            processing_time_ms,
            data,
            metadata,
        };
        event.validate()?;
        Ok(event)
    }
}
