//! Error types for the server.
//!
//! [`StartupError`] is the only error allowed to end the process; it is
//! carried in a rootcause report from `main`. [`ApiError`] is what HTTP
//! handlers return and renders as `{"success": false, "error": ...}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use tether_integration::{LifecycleError, ProviderError};

/// Failures while bringing the server up.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration is missing or invalid.
    Configuration { details: String },
    /// The database could not be reached.
    Database { details: String },
    /// Schema migrations failed.
    Migration { details: String },
    /// The listen address could not be bound.
    Bind { addr: String, details: String },
    /// The HTTP server stopped with an error.
    Server { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { details } => write!(f, "configuration error: {details}"),
            Self::Database { details } => write!(f, "database connection failed: {details}"),
            Self::Migration { details } => write!(f, "database migration failed: {details}"),
            Self::Bind { addr, details } => write!(f, "failed to bind {addr}: {details}"),
            Self::Server { details } => write!(f, "server error: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}

impl StartupError {
    /// Wraps anything displayable as a configuration error.
    pub fn configuration(e: impl fmt::Display) -> Self {
        Self::Configuration {
            details: e.to_string(),
        }
    }
}

/// An error returned from an HTTP handler.
#[derive(Debug)]
pub enum ApiError {
    /// A lifecycle operation failed.
    Lifecycle(LifecycleError),
    /// The request itself was malformed.
    BadRequest { reason: String },
}

impl ApiError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Lifecycle(e) => match e {
                LifecycleError::NotFound { .. } | LifecycleError::ProviderNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                LifecycleError::InvalidState { .. } => StatusCode::CONFLICT,
                LifecycleError::OAuthState { .. } => StatusCode::BAD_REQUEST,
                LifecycleError::Provider(ProviderError::Timeout { .. }) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                LifecycleError::Provider(_) => StatusCode::BAD_GATEWAY,
                LifecycleError::Decryption(_) | LifecycleError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    /// Text shown to the caller. Datastore details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::BadRequest { reason } => reason.clone(),
            Self::Lifecycle(LifecycleError::Store(e)) => {
                tracing::error!(error = %e, "datastore error");
                "internal datastore error".to_string()
            }
            Self::Lifecycle(e) => e.to_string(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle(e) => write!(f, "{e}"),
            Self::BadRequest { reason } => write!(f, "bad request: {reason}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        Self::Lifecycle(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "success": false,
            "error": self.public_message(),
        });
        (status, Json(body)).into_response()
    }
}
