use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::lifecycle::LifecycleError;
use crate::pipeline::{BuildError, ValidationError};
use crate::probe::ProbeError;
use crate::registry::RegistryError;
use crate::runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<BuildError> for AppError {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::Timeout(secs) => AppError::Build(format!("image build exceeded {}s", secs)),
            other => AppError::Build(other.to_string()),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::Validation(e.0)
    }
}

impl From<LifecycleError> for AppError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::Timeout { operation, .. } => AppError::Timeout(operation.to_string()),
            LifecycleError::Runtime(RuntimeError::NotFound(what)) => AppError::NotFound(what),
            LifecycleError::Runtime(e) => AppError::Runtime(e.to_string()),
        }
    }
}

impl From<RuntimeError> for AppError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound(what) => AppError::NotFound(what),
            other => AppError::Runtime(other.to_string()),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        AppError::Conflict(e.to_string())
    }
}

impl From<ProbeError> for AppError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Transport(e) => AppError::Upstream(e.to_string()),
            other => AppError::Validation(other.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials(_) | AuthError::InvalidToken => AppError::Unauthorized,
            AuthError::Unavailable(msg) => AppError::Upstream(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, msg) = match &self {
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", m.clone()),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "a valid bearer token is required".to_string(),
            ),
            AppError::Forbidden(reason) => {
                (StatusCode::FORBIDDEN, "permission_denied", reason.clone())
            }
            AppError::NotFound(what) => {
                (StatusCode::NOT_FOUND, "not_found", format!("{} not found", what))
            }
            AppError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m.clone()),
            AppError::Build(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "build_failed",
                format!("image build failed: {}", m),
            ),
            AppError::Runtime(m) => {
                tracing::error!("container runtime error: {}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, "runtime_error", m.clone())
            }
            AppError::Timeout(what) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                format!("{} timed out", what),
            ),
            AppError::ServiceUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "service unavailable".to_string(),
            ),
            AppError::Upstream(m) => (StatusCode::BAD_GATEWAY, "upstream_error", m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "success": false,
            "error": msg,
            "code": code,
        });
        if let AppError::ServiceUnavailable(name) = &self {
            body["service"] = json!(name);
        }

        (status, Json(body)).into_response()
    }
}
