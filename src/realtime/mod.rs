//! # Real-Time Module
//!
//! Authenticated topic subscriptions over WebSocket, one gateway per
//! module server.
//!
//! ## Architecture
//!
//! - **Registry**: connection table and topic index behind one lock
//! - **Gateway**: per-connection protocol handling and server push
//! - **Directory**: gateways by module, built at startup
//! - **Relay**: event log consumer that pushes stream events to topics

pub mod connection;
pub mod directory;
pub mod errors;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod relay;

pub use connection::{ConnectionInfo, ConnectionState, Outbound};
pub use directory::GatewayDirectory;
pub use errors::{RealtimeError, RealtimeResult};
pub use gateway::{Gateway, GatewayConfig, GatewayStats, MessageOutcome};
pub use protocol::{qualified_topic, ClientMessage, MessageType, ServerMessage};
pub use registry::{BroadcastReport, RegistryStats, SubscriptionRegistry};
pub use relay::{topic_for, EventRelay};
