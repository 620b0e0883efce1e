//! # Auth Module
//!
//! Shared-secret JWT credentials for the real-time gateway and the
//! module HTTP routes.

pub mod errors;
pub mod jwt;

pub use errors::{AuthError, AuthResult};
pub use jwt::{extract_bearer_token, Identity, JwtClaims, JwtConfig, JwtManager};
