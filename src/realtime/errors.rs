//! # Real-Time Errors
//!
//! Error types for the real-time module.

use thiserror::Error;

use crate::errors::ErrorClass;

/// Result type for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Real-time errors
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    // ==================
    // Connection Errors
    // ==================
    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection is not registered
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Invalid message format
    #[error("Invalid message format")]
    InvalidMessage(String),

    /// Message too large
    #[error("Message too large (max: {0} bytes)")]
    MessageTooLarge(usize),

    /// Message type a client may not send
    #[error("Clients cannot send '{0}' messages")]
    UnsupportedMessage(String),

    // ==================
    // Subscription Errors
    // ==================
    /// Topic missing or not a valid name
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Topic is not offered by this module
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    // ==================
    // Authentication Errors
    // ==================
    /// Authentication required
    #[error("Authentication required")]
    AuthenticationRequired,

    /// Credential rejected
    #[error("Authentication failed")]
    AuthenticationFailed(String),

    /// Credential sent on an authenticated connection
    #[error("Connection is already authenticated")]
    AlreadyAuthenticated,

    // ==================
    // Directory Errors
    // ==================
    /// No gateway registered for the module
    #[error("No real-time gateway for module: {0}")]
    UnknownModule(String),

    // ==================
    // Internal Errors
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Returns the close code for WebSocket
    pub fn close_code(&self) -> u16 {
        match self {
            RealtimeError::ConnectionClosed => 1000,
            RealtimeError::InvalidMessage(_) => 1003,
            RealtimeError::MessageTooLarge(_) => 1009,
            RealtimeError::InvalidTopic(_) => 4000,
            RealtimeError::UnknownTopic(_) => 4001,
            RealtimeError::UnsupportedMessage(_) => 4002,
            RealtimeError::AuthenticationFailed(_) => 4003,
            RealtimeError::AuthenticationRequired => 4004,
            RealtimeError::AlreadyAuthenticated => 4005,
            RealtimeError::ConnectionNotFound(_) => 4404,
            RealtimeError::UnknownModule(_) => 4404,
            RealtimeError::Internal(_) => 4500,
        }
    }

    /// Returns the caller-facing error class
    pub fn class(&self) -> ErrorClass {
        match self {
            RealtimeError::AuthenticationRequired | RealtimeError::AuthenticationFailed(_) => {
                ErrorClass::Authentication
            }
            RealtimeError::ConnectionClosed | RealtimeError::Internal(_) => ErrorClass::Internal,
            _ => ErrorClass::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_close_codes() {
        assert_eq!(RealtimeError::ConnectionClosed.close_code(), 1000);
        assert_eq!(
            RealtimeError::AuthenticationFailed("bad signature".into()).close_code(),
            4003
        );
        assert_eq!(RealtimeError::MessageTooLarge(1024).close_code(), 1009);
    }

    #[test]
    fn test_client_facing_text() {
        assert_eq!(
            RealtimeError::InvalidMessage("expected value".into()).to_string(),
            "Invalid message format"
        );
        assert_eq!(
            RealtimeError::AuthenticationFailed("expired".into()).to_string(),
            "Authentication failed"
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            RealtimeError::AuthenticationRequired.class(),
            ErrorClass::Authentication
        );
        assert_eq!(
            RealtimeError::AlreadyAuthenticated.class(),
            ErrorClass::Validation
        );
    }
}
