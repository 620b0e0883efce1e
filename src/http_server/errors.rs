//! # HTTP Errors
//!
//! `ApiError` is what route handlers return. It renders as
//! `{error: <code>, message: <text>}` with the status of its error class.
//! Store and internal failures never leak their detail to the caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::aggregator::{AggregateError, ModuleError};
use crate::auth::AuthError;
use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::errors::ErrorClass;
use crate::event_log::EventLogError;

/// Errors returned by route handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Request body rejected before reaching a module
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Auth(e) => e.class(),
            ApiError::Aggregate(e) => e.class(),
            ApiError::EventLog(e) => e.class(),
            ApiError::Cache(e) => e.class(),
            ApiError::BadRequest(_) => ErrorClass::Validation,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.class().status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Text shown to the caller
    fn public_message(&self) -> String {
        match self {
            ApiError::EventLog(EventLogError::Unavailable { .. }) => "Event store unavailable".to_string(),
            ApiError::Aggregate(AggregateError::TotalFailure(_)) => self.to_string(),
            _ => match self.class() {
                ErrorClass::Internal => "Internal server error".to_string(),
                ErrorClass::UpstreamUnavailable => "Upstream service unavailable".to_string(),
                _ => self.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.class();
        match class {
            ErrorClass::Internal | ErrorClass::UpstreamUnavailable => {
                error!(error = %self, "request failed")
            }
            ErrorClass::Authentication => warn!(error = %self, "request rejected"),
            _ => {}
        }

        let mut body = json!({
            "error": class.code(),
            "message": self.public_message(),
        });
        if let ApiError::Aggregate(AggregateError::TotalFailure(failures)) = &self {
            body["errors"] = json!(failures);
        }
        (self.status_code(), Json(body)).into_response()
    }
}

/// Errors that stop a module server from starting
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open event log: {0}")]
    EventLog(#[from] EventLogError),

    #[error("Failed to build module client: {0}")]
    ModuleClient(#[from] ModuleError),

    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
