//! # Wire Protocol
//!
//! JSON envelopes exchanged over the real-time socket.
//!
//! Clients send `{type, module?, topic?, payload?, token?}`. The server
//! replies with `{type, module, topic?, payload}`; errors are carried as
//! `{type: "event", payload: {error}}`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::errors::{RealtimeError, RealtimeResult};

/// Envelope type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Subscribe,
    Unsubscribe,
    Query,
    ContextUpdate,
    Event,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Query => "query",
            MessageType::ContextUpdate => "context_update",
            MessageType::Event => "event",
        }
    }
}

/// Message from client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ClientMessage {
    /// Parse a text frame
    pub fn parse(text: &str) -> RealtimeResult<Self> {
        serde_json::from_str(text).map_err(|e| RealtimeError::InvalidMessage(e.to_string()))
    }

    /// Non-empty token, if the message carries one
    pub fn credential(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Message from server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub payload: Value,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl ServerMessage {
    fn event(module: &str, payload: Value) -> Self {
        Self {
            msg_type: MessageType::Event,
            module: module.to_string(),
            topic: None,
            payload,
        }
    }

    /// Sent once on connect
    pub fn welcome(module: &str, connection_id: &str) -> Self {
        Self::event(
            module,
            json!({
                "message": "Connected to real-time server",
                "module": module,
                "connectionId": connection_id,
            }),
        )
    }

    pub fn authenticated(module: &str, user_id: &str) -> Self {
        Self::event(
            module,
            json!({"message": "Authentication successful", "userId": user_id}),
        )
    }

    /// Error reply; the connection stays open unless followed by a close
    pub fn error(module: &str, error: impl Into<String>) -> Self {
        Self::event(module, json!({"error": error.into()}))
    }

    pub fn subscribed(module: &str, topic: &str) -> Self {
        Self::event(
            module,
            json!({"message": format!("Subscribed to topic: {}", topic), "topic": topic}),
        )
    }

    pub fn unsubscribed(module: &str, topic: &str) -> Self {
        Self::event(
            module,
            json!({"message": format!("Unsubscribed from topic: {}", topic), "topic": topic}),
        )
    }

    /// Reply to an authenticated `query` without a token
    pub fn status(module: &str, status: Value) -> Self {
        Self::event(module, status)
    }

    /// Context pushed to topic subscribers
    pub fn context_update(module: &str, topic: &str, context: Value) -> Self {
        Self {
            msg_type: MessageType::ContextUpdate,
            module: module.to_string(),
            topic: Some(topic.to_string()),
            payload: json!({"context": context, "timestamp": now_rfc3339()}),
        }
    }

    /// Domain event pushed to topic subscribers
    pub fn pushed_event(module: &str, topic: &str, event: Value) -> Self {
        Self {
            msg_type: MessageType::Event,
            module: module.to_string(),
            topic: Some(topic.to_string()),
            payload: json!({"event": event, "timestamp": now_rfc3339()}),
        }
    }

    pub fn to_json(&self) -> RealtimeResult<String> {
        serde_json::to_string(self).map_err(|e| RealtimeError::Internal(e.to_string()))
    }
}

/// Registry key of a topic: `<module>:<topic>`
pub fn qualified_topic(module: &str, topic: &str) -> String {
    format!("{}:{}", module, topic)
}
