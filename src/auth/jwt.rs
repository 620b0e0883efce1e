//! # JWT Credentials
//!
//! HS256 tokens shared by every module server. Validation is stateless:
//! a token is accepted when its signature matches the shared secret and it
//! has not expired.

use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::errors::{AuthError, AuthResult};

/// JWT claims carried by platform credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// User ID
    pub id: String,

    /// User's email
    pub email: String,

    /// User's role
    pub role: String,

    /// Issued at timestamp (Unix epoch seconds)
    pub iat: i64,

    /// Expiration timestamp (Unix epoch seconds)
    pub exp: i64,

    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub role: String,
}

impl From<JwtClaims> for Identity {
    fn from(claims: JwtClaims) -> Self {
        Self {
            user_id: claims.id,
            email: claims.email,
            role: claims.role,
        }
    }
}

/// JWT configuration
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Shared signing secret
    pub secret: String,

    /// Lifetime of issued tokens
    pub token_ttl: Duration,

    /// Required issuer, if any
    pub issuer: Option<String>,
}

impl JwtConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            token_ttl: Duration::minutes(60),
            issuer: None,
        }
    }
}

/// JWT manager for token issuance and validation
#[derive(Clone)]
pub struct JwtManager {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for JwtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtManager")
            .field("token_ttl", &self.config.token_ttl)
            .field("issuer", &self.config.issuer)
            .finish_non_exhaustive()
    }
}

impl JwtManager {
    /// Create a new JWT manager with the given configuration
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// Issue a token for the given identity with the configured lifetime
    pub fn issue(&self, identity: &Identity) -> AuthResult<String> {
        self.issue_with_ttl(identity, self.config.token_ttl)
    }

    /// Issue a token with an explicit lifetime
    pub fn issue_with_ttl(&self, identity: &Identity, ttl: Duration) -> AuthResult<String> {
        let now = Utc::now();
        let claims = JwtClaims {
            id: identity.user_id.clone(),
            email: identity.email.clone(),
            role: identity.role.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            iss: self.config.issuer.clone(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| AuthError::TokenGenerationFailed)
    }

    /// Validate a token and extract its claims
    pub fn validate_token(&self, token: &str) -> AuthResult<JwtClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }

        let token_data =
            decode::<JwtClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        AuthError::InvalidSignature
                    }
                    _ => AuthError::MalformedToken,
                }
            })?;

        if token_data.claims.id.trim().is_empty() {
            return Err(AuthError::InvalidClaims("id must not be empty".into()));
        }

        Ok(token_data.claims)
    }

    /// Validate a token and return the caller identity
    pub fn authenticate(&self, token: &str) -> AuthResult<Identity> {
        self.validate_token(token).map(Identity::from)
    }

    /// Validate the bearer token of an HTTP request
    pub fn authenticate_headers(&self, headers: &HeaderMap) -> AuthResult<Identity> {
        let token = extract_bearer_token(headers).ok_or(AuthError::MissingToken)?;
        self.authenticate(token)
    }
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}
