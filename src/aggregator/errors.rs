//! # Aggregation Errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::errors::ErrorClass;

/// Result type for aggregation
pub type AggregateResult<T> = Result<T, AggregateError>;

/// Failure of a single module call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// No response within the per-module timeout
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Transport failure
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Non-success HTTP status
    #[error("responded with status {0}")]
    Status(u16),

    /// Response body is not JSON
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ModuleError {
    /// Stable machine code
    pub fn code(&self) -> &'static str {
        match self {
            ModuleError::Timeout(_) => "timeout",
            ModuleError::Unavailable(_) => "unavailable",
            ModuleError::Status(_) => "bad_status",
            ModuleError::InvalidResponse(_) => "invalid_response",
        }
    }

    /// Fixed text for callers; transport detail stays in the logs
    pub fn public_message(&self) -> &'static str {
        match self {
            ModuleError::Timeout(_) => "Module did not respond in time",
            ModuleError::Unavailable(_) => "Module unreachable",
            ModuleError::Status(_) => "Module returned an error status",
            ModuleError::InvalidResponse(_) => "Module returned an unreadable response",
        }
    }
}

/// Per-module error entry of an aggregated response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleFailure {
    pub module: String,
    pub code: String,
    pub error: String,
    pub latency_ms: u64,
}

impl ModuleFailure {
    pub fn new(module: impl Into<String>, error: &ModuleError, latency_ms: u64) -> Self {
        Self {
            module: module.into(),
            code: error.code().to_string(),
            error: error.public_message().to_string(),
            latency_ms,
        }
    }
}

/// Aggregation errors
#[derive(Debug, Clone, Error)]
pub enum AggregateError {
    // ==================
    // Validation Errors
    // ==================
    /// Query text is empty
    #[error("query must not be empty")]
    EmptyQuery,

    /// Module not in the directory
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// Request body could not be parsed
    #[error("Invalid aggregation request: {0}")]
    InvalidRequest(String),

    // ==================
    // Upstream Errors
    // ==================
    /// Every target module failed
    #[error("All {} target modules failed", .0.len())]
    TotalFailure(Vec<ModuleFailure>),

    // ==================
    // Internal Errors
    // ==================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AggregateError {
    /// Returns the caller-facing error class
    pub fn class(&self) -> ErrorClass {
        match self {
            AggregateError::EmptyQuery
            | AggregateError::UnknownModule(_)
            | AggregateError::InvalidRequest(_) => ErrorClass::Validation,
            AggregateError::TotalFailure(_) => ErrorClass::TotalFailure,
            AggregateError::Internal(_) => ErrorClass::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.class().status_code()
    }
}

impl From<CacheError> for AggregateError {
    fn from(e: CacheError) -> Self {
        AggregateError::Internal(e.to_string())
    }
}
