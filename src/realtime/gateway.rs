//! # Real-Time Gateway
//!
//! Per-module WebSocket endpoint.
//!
//! Each socket gets a reader loop and a writer task. The reader handles
//! client messages strictly in order; every reply, broadcast and close goes
//! through the connection's outbound queue, which the writer drains into
//! the socket. Message handling itself is synchronous and does not touch
//! the socket, so it can be exercised without a network.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::connection::{ConnectionInfo, Outbound, OutboundReceiver};
use super::errors::{RealtimeError, RealtimeResult};
use super::protocol::{qualified_topic, ClientMessage, MessageType, ServerMessage};
use super::registry::{BroadcastReport, RegistryStats, SubscriptionRegistry};
use crate::auth::JwtManager;
use crate::naming::is_valid_name;
use crate::observability::MetricsRegistry;

/// Close code sent when the server shuts down
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Largest accepted text frame
    pub max_message_bytes: usize,

    /// Topics clients may subscribe to; `None` accepts any valid name
    pub allowed_topics: Option<HashSet<String>>,

    /// Interval of server-initiated pings
    pub ping_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024,
            allowed_topics: None,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// What the reader loop does after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Continue,
    Close,
}

/// Gateway counters
pub type GatewayStats = RegistryStats;

/// Real-time gateway of one module
pub struct Gateway {
    module: String,
    config: GatewayConfig,
    registry: SubscriptionRegistry,
    jwt: Arc<JwtManager>,
    metrics: Arc<MetricsRegistry>,
}

impl Gateway {
    pub fn new(
        module: impl Into<String>,
        config: GatewayConfig,
        jwt: Arc<JwtManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            module: module.into(),
            config,
            registry: SubscriptionRegistry::new(),
            jwt,
            metrics,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    // ==================
    // Connection lifecycle
    // ==================

    /// Register a connection and queue the welcome message
    pub fn connect(&self) -> RealtimeResult<(String, OutboundReceiver)> {
        let (id, rx) = self.registry.register(&self.module)?;
        self.reply(&id, &ServerMessage::welcome(&self.module, &id));
        self.metrics.increment_connections_opened();
        info!(module = %self.module, connection_id = %id, "client connected");
        Ok((id, rx))
    }

    /// Remove a connection from every topic and the connection table
    pub fn disconnect(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let removed = self.registry.remove(connection_id);
        if removed.is_some() {
            self.metrics.increment_connections_closed();
            info!(module = %self.module, connection_id = %connection_id, "client disconnected");
        }
        removed
    }

    fn reply(&self, connection_id: &str, message: &ServerMessage) {
        match message.to_json() {
            Ok(text) => {
                self.registry.send_to(connection_id, Outbound::Text(text));
            }
            Err(e) => warn!(connection_id = %connection_id, error = %e, "failed to encode reply"),
        }
    }

    fn reply_error(&self, connection_id: &str, error: &RealtimeError) {
        self.reply(connection_id, &ServerMessage::error(&self.module, error.to_string()));
    }

    // ==================
    // Message handling
    // ==================

    /// Handle one text frame from `connection_id`
    pub fn handle_message(&self, connection_id: &str, text: &str) -> MessageOutcome {
        if text.len() > self.config.max_message_bytes {
            self.reply_error(
                connection_id,
                &RealtimeError::MessageTooLarge(self.config.max_message_bytes),
            );
            return MessageOutcome::Continue;
        }

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id = %connection_id, error = ?e, "malformed client message");
                self.reply_error(connection_id, &e);
                return MessageOutcome::Continue;
            }
        };

        if message.msg_type == MessageType::Query {
            if let Some(token) = message.credential() {
                return self.handle_credential(connection_id, token);
            }
        }

        if !self.registry.is_authenticated(connection_id) {
            self.reply_error(connection_id, &RealtimeError::AuthenticationRequired);
            return MessageOutcome::Continue;
        }

        let result = match message.msg_type {
            MessageType::Subscribe => self.handle_subscribe(connection_id, message.topic.as_deref()),
            MessageType::Unsubscribe => {
                self.handle_unsubscribe(connection_id, message.topic.as_deref())
            }
            MessageType::Query => self.handle_status(connection_id),
            MessageType::Event | MessageType::ContextUpdate => Err(
                RealtimeError::UnsupportedMessage(message.msg_type.as_str().to_string()),
            ),
        };

        if let Err(e) = result {
            debug!(connection_id = %connection_id, error = %e, "client message rejected");
            self.reply_error(connection_id, &e);
        }
        MessageOutcome::Continue
    }

    fn handle_credential(&self, connection_id: &str, token: &str) -> MessageOutcome {
        if self.registry.is_authenticated(connection_id) {
            self.reply_error(connection_id, &RealtimeError::AlreadyAuthenticated);
            return MessageOutcome::Continue;
        }

        let failure = match self.jwt.authenticate(token) {
            Ok(identity) => {
                let user_id = identity.user_id.clone();
                match self.registry.authenticate(connection_id, identity) {
                    Ok(()) => {
                        info!(
                            module = %self.module,
                            connection_id = %connection_id,
                            user_id = %user_id,
                            "client authenticated"
                        );
                        self.reply(
                            connection_id,
                            &ServerMessage::authenticated(&self.module, &user_id),
                        );
                        return MessageOutcome::Continue;
                    }
                    Err(RealtimeError::AlreadyAuthenticated) => {
                        self.reply_error(connection_id, &RealtimeError::AlreadyAuthenticated);
                        return MessageOutcome::Continue;
                    }
                    Err(e) => RealtimeError::AuthenticationFailed(e.to_string()),
                }
            }
            Err(e) => RealtimeError::AuthenticationFailed(e.to_string()),
        };

        self.metrics.increment_auth_failures();
        if let RealtimeError::AuthenticationFailed(reason) = &failure {
            warn!(module = %self.module, connection_id = %connection_id, reason = %reason, "authentication failed");
        }
        self.reply_error(connection_id, &failure);
        self.registry.send_to(
            connection_id,
            Outbound::Close {
                code: failure.close_code(),
                reason: failure.to_string(),
            },
        );
        MessageOutcome::Close
    }

    fn check_topic(&self, topic: Option<&str>) -> RealtimeResult<String> {
        let topic = topic.ok_or_else(|| RealtimeError::InvalidTopic("topic is required".into()))?;
        if !is_valid_name(topic) {
            return Err(RealtimeError::InvalidTopic(topic.to_string()));
        }
        if let Some(allowed) = &self.config.allowed_topics {
            if !allowed.contains(topic) {
                return Err(RealtimeError::UnknownTopic(topic.to_string()));
            }
        }
        Ok(topic.to_string())
    }

    fn handle_subscribe(&self, connection_id: &str, topic: Option<&str>) -> RealtimeResult<()> {
        let topic = self.check_topic(topic)?;
        self.registry
            .subscribe(connection_id, &qualified_topic(&self.module, &topic))?;
        info!(module = %self.module, connection_id = %connection_id, topic = %topic, "client subscribed");
        self.reply(connection_id, &ServerMessage::subscribed(&self.module, &topic));
        Ok(())
    }

    fn handle_unsubscribe(&self, connection_id: &str, topic: Option<&str>) -> RealtimeResult<()> {
        let topic = self.check_topic(topic)?;
        self.registry
            .unsubscribe(connection_id, &qualified_topic(&self.module, &topic))?;
        info!(module = %self.module, connection_id = %connection_id, topic = %topic, "client unsubscribed");
        self.reply(connection_id, &ServerMessage::unsubscribed(&self.module, &topic));
        Ok(())
    }

    fn handle_status(&self, connection_id: &str) -> RealtimeResult<()> {
        let info = self
            .registry
            .connection(connection_id)
            .ok_or_else(|| RealtimeError::ConnectionNotFound(connection_id.to_string()))?;
        let status = serde_json::to_value(&info).map_err(|e| RealtimeError::Internal(e.to_string()))?;
        self.reply(connection_id, &ServerMessage::status(&self.module, status));
        Ok(())
    }

    // ==================
    // Server push
    // ==================

    fn publish(&self, topic: &str, message: &ServerMessage) -> RealtimeResult<BroadcastReport> {
        let text = message.to_json()?;
        let report = self
            .registry
            .broadcast(&qualified_topic(&self.module, topic), &text);
        self.metrics
            .record_broadcast(report.delivered as u64, report.failed as u64);
        debug!(
            module = %self.module,
            topic = %topic,
            matched = report.matched,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast to topic"
        );
        Ok(report)
    }

    /// Send `payload` as an event to every authenticated subscriber of `topic`
    pub fn broadcast(&self, topic: &str, payload: Value) -> RealtimeResult<BroadcastReport> {
        let message = ServerMessage {
            msg_type: MessageType::Event,
            module: self.module.clone(),
            topic: Some(topic.to_string()),
            payload,
        };
        self.publish(topic, &message)
    }

    /// Push a context update to `topic`
    pub fn push_context_update(&self, topic: &str, context: Value) -> RealtimeResult<BroadcastReport> {
        self.publish(topic, &ServerMessage::context_update(&self.module, topic, context))
    }

    /// Push a domain event to `topic`
    pub fn push_event<T: Serialize>(&self, topic: &str, event: &T) -> RealtimeResult<BroadcastReport> {
        let event = serde_json::to_value(event).map_err(|e| RealtimeError::Internal(e.to_string()))?;
        self.publish(topic, &ServerMessage::pushed_event(&self.module, topic, event))
    }

    pub fn stats(&self) -> GatewayStats {
        self.registry.stats()
    }

    /// Stats as served by the health and metrics routes
    pub fn stats_json(&self) -> Value {
        let stats = self.stats();
        json!({
            "module": self.module,
            "connectedClients": stats.connected_clients,
            "authenticatedClients": stats.authenticated_clients,
            "topics": stats.topics,
            "subscriptions": stats.subscriptions,
        })
    }

    /// Ask every connection to close
    pub fn close_all(&self, reason: &str) -> usize {
        let count = self.registry.send_all(Outbound::Close {
            code: CLOSE_GOING_AWAY,
            reason: reason.to_string(),
        });
        info!(module = %self.module, connections = count, "closing all connections");
        count
    }

    // ==================
    // Socket loop
    // ==================

    /// Serve one upgraded WebSocket until it closes
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let (connection_id, mut outbound) = match self.connect() {
            Ok(registered) => registered,
            Err(e) => {
                warn!(module = %self.module, error = %e, "failed to register connection");
                return;
            }
        };

        let (mut sender, mut receiver) = socket.split();
        let ping_interval = self.config.ping_interval;

        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        let result = match frame {
                            Outbound::Text(text) => sender.send(Message::Text(text)).await,
                            Outbound::Pong(data) => sender.send(Message::Pong(data)).await,
                            Outbound::Close { code, reason } => {
                                let _ = sender
                                    .send(Message::Close(Some(CloseFrame {
                                        code,
                                        reason: Cow::Owned(reason),
                                    })))
                                    .await;
                                break;
                            }
                        };
                        if result.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if self.handle_message(&connection_id, &text) == MessageOutcome::Close {
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    self.reply_error(
                        &connection_id,
                        &RealtimeError::InvalidMessage("binary frames are not supported".into()),
                    );
                }
                Ok(Message::Ping(data)) => {
                    self.registry.send_to(&connection_id, Outbound::Pong(data));
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(connection_id = %connection_id, error = %e, "socket error");
                    break;
                }
            }
        }

        // Dropping the registry entry drops the outbound sender, which ends
        // the writer after it flushes queued frames.
        self.disconnect(&connection_id);
        let _ = writer.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, JwtConfig};
    use tokio::sync::mpsc::error::TryRecvError;

    const SECRET: &str = "gateway_test_secret";

    fn gateway() -> Gateway {
        gateway_for("finbot")
    }

    fn gateway_for(module: &str) -> Gateway {
        Gateway::new(
            module,
            GatewayConfig::default(),
            Arc::new(JwtManager::new(JwtConfig::new(SECRET))),
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn token() -> String {
        JwtManager::new(JwtConfig::new(SECRET))
            .issue(&Identity {
                user_id: "u-1".into(),
                email: "ana@example.com".into(),
                role: "admin".into(),
            })
            .unwrap()
    }

    fn next_json(rx: &mut OutboundReceiver) -> Value {
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    fn connect_authenticated(gw: &Gateway) -> (String, OutboundReceiver) {
        let (id, mut rx) = gw.connect().unwrap();
        next_json(&mut rx);
        let auth = json!({"type": "query", "token": token()}).to_string();
        assert_eq!(gw.handle_message(&id, &auth), MessageOutcome::Continue);
        let reply = next_json(&mut rx);
        assert_eq!(reply["payload"]["message"], "Authentication successful");
        (id, rx)
    }

    #[test]
    fn test_welcome_message() {
        let gw = gateway();
        let (id, mut rx) = gw.connect().unwrap();
        let welcome = next_json(&mut rx);
        assert_eq!(welcome["type"], "event");
        assert_eq!(welcome["payload"]["connectionId"], id.as_str());
        assert_eq!(welcome["payload"]["module"], "finbot");
    }

    #[test]
    fn test_subscribe_requires_authentication() {
        let gw = gateway();
        let (id, mut rx) = gw.connect().unwrap();
        next_json(&mut rx);

        gw.handle_message(&id, r#"{"type":"subscribe","topic":"accounts"}"#);
        let reply = next_json(&mut rx);
        assert_eq!(reply["payload"]["error"], "Authentication required");
        assert!(gw.registry().subscribers("finbot:accounts").is_empty());
    }

    #[test]
    fn test_malformed_message_keeps_connection() {
        let gw = gateway();
        let (id, mut rx) = gw.connect().unwrap();
        next_json(&mut rx);

        assert_eq!(gw.handle_message(&id, "{nope"), MessageOutcome::Continue);
        let reply = next_json(&mut rx);
        assert_eq!(reply["payload"]["error"], "Invalid message format");
        assert!(gw.registry().connection(&id).is_some());
    }

    #[test]
    fn test_bad_token_closes_with_4003() {
        let gw = gateway();
        let (id, mut rx) = gw.connect().unwrap();
        next_json(&mut rx);

        let outcome = gw.handle_message(&id, r#"{"type":"query","token":"forged"}"#);
        assert_eq!(outcome, MessageOutcome::Close);

        let reply = next_json(&mut rx);
        assert_eq!(reply["payload"]["error"], "Authentication failed");
        match rx.try_recv().unwrap() {
            Outbound::Close { code, .. } => assert_eq!(code, 4003),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_and_push() {
        let gw = gateway();
        let (id, mut rx) = connect_authenticated(&gw);

        gw.handle_message(&id, r#"{"type":"subscribe","topic":"accounts"}"#);
        let reply = next_json(&mut rx);
        assert_eq!(reply["payload"]["message"], "Subscribed to topic: accounts");

        let report = gw
            .push_context_update("accounts", json!({"balance": 42}))
            .unwrap();
        assert_eq!(report.delivered, 1);
        let pushed = next_json(&mut rx);
        assert_eq!(pushed["type"], "context_update");
        assert_eq!(pushed["payload"]["context"]["balance"], 42);
    }

    #[test]
    fn test_same_topic_name_isolated_per_module() {
        let finbot = gateway_for("finbot");
        let mubot = gateway_for("mubot");
        let (fin_id, mut fin_rx) = connect_authenticated(&finbot);
        let (mu_id, mut mu_rx) = connect_authenticated(&mubot);

        for (gw, id, rx) in [(&finbot, &fin_id, &mut fin_rx), (&mubot, &mu_id, &mut mu_rx)] {
            gw.handle_message(id, r#"{"type":"subscribe","topic":"accounts"}"#);
            next_json(rx);
        }

        let report = finbot.push_event("accounts", &json!({"id": "e1"})).unwrap();
        assert_eq!(
            report,
            BroadcastReport {
                matched: 1,
                delivered: 1,
                failed: 0
            }
        );

        let pushed = next_json(&mut fin_rx);
        assert_eq!(pushed["module"], "finbot");
        assert_eq!(pushed["payload"]["event"]["id"], "e1");
        assert!(matches!(mu_rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(finbot.registry().subscribers("mubot:accounts").is_empty());
    }

    #[test]
    fn test_reauthentication_rejected() {
        let gw = gateway();
        let (id, mut rx) = connect_authenticated(&gw);

        let again = json!({"type": "query", "token": token()}).to_string();
        assert_eq!(gw.handle_message(&id, &again), MessageOutcome::Continue);
        let reply = next_json(&mut rx);
        assert_eq!(reply["payload"]["error"], "Connection is already authenticated");
    }

    #[test]
    fn test_status_query_and_client_publish() {
        let gw = gateway();
        let (id, mut rx) = connect_authenticated(&gw);
        gw.handle_message(&id, r#"{"type":"subscribe","topic":"budgets"}"#);
        next_json(&mut rx);

        gw.handle_message(&id, r#"{"type":"query"}"#);
        let status = next_json(&mut rx);
        assert_eq!(status["payload"]["identity"]["userId"], "u-1");
        assert_eq!(status["payload"]["topics"][0], "finbot:budgets");

        gw.handle_message(&id, r#"{"type":"event","payload":{}}"#);
        let reply = next_json(&mut rx);
        assert!(reply["payload"]["error"]
            .as_str()
            .unwrap()
            .contains("event"));
    }

    #[test]
    fn test_invalid_and_unknown_topics() {
        let mut config = GatewayConfig::default();
        config.allowed_topics = Some(["accounts".to_string()].into_iter().collect());
        let gw = Gateway::new(
            "finbot",
            config,
            Arc::new(JwtManager::new(JwtConfig::new(SECRET))),
            Arc::new(MetricsRegistry::new()),
        );
        let (id, mut rx) = connect_authenticated(&gw);

        gw.handle_message(&id, r#"{"type":"subscribe","topic":"a b"}"#);
        assert!(next_json(&mut rx)["payload"]["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid topic"));

        gw.handle_message(&id, r#"{"type":"subscribe","topic":"payroll"}"#);
        assert!(next_json(&mut rx)["payload"]["error"]
            .as_str()
            .unwrap()
            .starts_with("Unknown topic"));
        assert_eq!(gw.stats().topics, 0);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut config = GatewayConfig::default();
        config.max_message_bytes = 16;
        let gw = Gateway::new(
            "finbot",
            config,
            Arc::new(JwtManager::new(JwtConfig::new(SECRET))),
            Arc::new(MetricsRegistry::new()),
        );
        let (id, mut rx) = gw.connect().unwrap();
        next_json(&mut rx);

        gw.handle_message(&id, &"x".repeat(64));
        assert!(next_json(&mut rx)["payload"]["error"]
            .as_str()
            .unwrap()
            .starts_with("Message too large"));
    }

    #[test]
    fn test_disconnect_and_close_all() {
        let gw = gateway();
        let (id, mut rx) = connect_authenticated(&gw);
        gw.handle_message(&id, r#"{"type":"subscribe","topic":"accounts"}"#);
        next_json(&mut rx);

        assert_eq!(gw.close_all("shutdown"), 1);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close { code: 1001, .. })));

        gw.disconnect(&id);
        assert!(gw.registry().subscribers("finbot:accounts").is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }
}
