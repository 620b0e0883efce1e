//! Per-connection state

use std::collections::BTreeSet;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Identity;

/// Connection lifecycle state
///
/// `Closed` is represented by removal from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Authenticated,
}

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame
    Text(String),
    /// Reply to a client ping
    Pong(Vec<u8>),
    /// Close the socket with a code and reason
    Close { code: u16, reason: String },
}

/// Sending half of a connection's outbound queue
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
/// Receiving half drained by the writer task
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// New connection id: `<module>-<uuid>`
pub fn new_connection_id(module: &str) -> String {
    format!("{}-{}", module, Uuid::new_v4())
}

/// A registered connection
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub module: String,
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    /// Qualified topics (`module:topic`)
    pub topics: BTreeSet<String>,
    pub sender: OutboundSender,
}

impl Connection {
    pub fn new(id: String, module: &str, sender: OutboundSender) -> Self {
        Self {
            id,
            module: module.to_string(),
            state: ConnectionState::Connected,
            identity: None,
            topics: BTreeSet::new(),
            sender,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    pub fn snapshot(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id.clone(),
            module: self.module.clone(),
            state: self.state,
            identity: self.identity.clone(),
            topics: self.topics.iter().cloned().collect(),
        }
    }
}

/// Read-only view of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub module: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    pub topics: Vec<String>,
}
