//! # Error Taxonomy
//!
//! Every module error maps onto one [`ErrorClass`], which fixes the HTTP
//! status and the stable machine code surfaced to callers.

use std::fmt;

use serde::Serialize;

/// Caller-facing error class shared by all modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    /// Missing, invalid or expired credential
    Authentication,
    /// Malformed message or request body, rejected without side effects
    Validation,
    /// A dependent module or store did not respond
    UpstreamUnavailable,
    /// Aggregation succeeded with at least one failing module
    PartialFailure,
    /// Every aggregation target failed
    TotalFailure,
    /// Anything else
    Internal,
}

impl ErrorClass {
    /// Returns the stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            ErrorClass::Authentication => "authentication_error",
            ErrorClass::Validation => "validation_error",
            ErrorClass::UpstreamUnavailable => "upstream_unavailable",
            ErrorClass::PartialFailure => "partial_failure",
            ErrorClass::TotalFailure => "total_failure",
            ErrorClass::Internal => "internal_error",
        }
    }

    /// Returns the HTTP status code for this class
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorClass::Authentication => 401,
            ErrorClass::Validation => 400,
            ErrorClass::UpstreamUnavailable => 503,
            ErrorClass::PartialFailure => 200,
            ErrorClass::TotalFailure => 502,
            ErrorClass::Internal => 500,
        }
    }

    /// Returns whether this class is the caller's fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, ErrorClass::Authentication | ErrorClass::Validation)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ErrorClass::Authentication.status_code(), 401);
        assert_eq!(ErrorClass::Validation.status_code(), 400);
        assert_eq!(ErrorClass::PartialFailure.status_code(), 200);
        assert_eq!(ErrorClass::TotalFailure.status_code(), 502);
    }

    #[test]
    fn test_client_errors() {
        assert!(ErrorClass::Validation.is_client_error());
        assert!(!ErrorClass::UpstreamUnavailable.is_client_error());
    }
}
