//! # Auth Errors
//!
//! Error types for credential validation.

use thiserror::Error;

use crate::errors::ErrorClass;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication errors
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    // ==================
    // Credential Errors
    // ==================
    /// No bearer token on the request
    #[error("Missing authorization header")]
    MissingToken,

    /// Caller must authenticate first
    #[error("Authentication required")]
    AuthenticationRequired,

    // ==================
    // JWT Errors
    // ==================
    /// JWT token is malformed
    #[error("Malformed token")]
    MalformedToken,

    /// JWT token has expired
    #[error("Token expired")]
    TokenExpired,

    /// JWT signature is invalid
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Token decoded but its claims are unusable
    #[error("Invalid token claims: {0}")]
    InvalidClaims(String),

    // ==================
    // Internal Errors
    // ==================
    /// Token generation failed
    #[error("Internal error: token generation failed")]
    TokenGenerationFailed,
}

impl AuthError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        self.class().status_code()
    }

    /// Returns the caller-facing error class
    pub fn class(&self) -> ErrorClass {
        match self {
            AuthError::TokenGenerationFailed => ErrorClass::Internal,
            _ => ErrorClass::Authentication,
        }
    }

    /// Returns whether this error should be logged at warn level
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}
