//! # Event Log Errors
//!
//! Error types for the event log and its consumers.

use std::io;

use thiserror::Error;

use crate::errors::ErrorClass;

/// Result type for event log operations
pub type EventLogResult<T> = Result<T, EventLogError>;

/// Event log errors
#[derive(Debug, Error)]
pub enum EventLogError {
    // ==================
    // Validation Errors
    // ==================
    /// Event failed parse-and-validate at the log boundary
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Stream, group or consumer name is not usable
    #[error("Invalid {kind} name: {name}")]
    InvalidName { kind: &'static str, name: String },

    /// Read or count argument out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ==================
    // Group Errors
    // ==================
    /// Group does not exist on the stream
    #[error("No such consumer group '{group}' on stream '{stream}'")]
    NoSuchGroup { stream: String, group: String },

    // ==================
    // Store Errors
    // ==================
    /// Journal I/O failed; the operation had no effect
    #[error("Event log unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: io::Error,
    },

    /// Journal contents failed checksum or structure validation
    #[error("Journal corruption in {path} at byte {offset}: {reason}")]
    Corruption {
        path: String,
        offset: u64,
        reason: String,
    },

    /// Internal state could not be accessed
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventLogError {
    /// Build an `Unavailable` error from an I/O failure
    pub fn unavailable(message: impl Into<String>, source: io::Error) -> Self {
        EventLogError::Unavailable {
            message: message.into(),
            source,
        }
    }

    /// Returns the caller-facing error class
    pub fn class(&self) -> ErrorClass {
        match self {
            EventLogError::InvalidEvent(_)
            | EventLogError::InvalidName { .. }
            | EventLogError::InvalidArgument(_)
            | EventLogError::NoSuchGroup { .. } => ErrorClass::Validation,
            EventLogError::Unavailable { .. } => ErrorClass::UpstreamUnavailable,
            EventLogError::Corruption { .. } | EventLogError::Internal(_) => ErrorClass::Internal,
        }
    }
}

/// Failure reported by an event handler
///
/// The consumer worker retries or dead-letters the event; the message is
/// recorded in the dead-letter metadata.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}
