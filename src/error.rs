use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::providers::types::ProviderError;
use crate::providers::RouteError;
use crate::services::auth::AuthError;
use crate::services::conversation::StoreError;
use crate::services::storage::UploadError;
use crate::services::validation::ValidationError;

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unauthorized")]
    Unauthenticated,

    #[error("{0}")]
    ValidationFailed(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Upstream provider error: {0}")]
    Upstream(#[from] ProviderError),

    #[error("{0}")]
    Configuration(String),

    #[error("Failed to persist: {0}")]
    Persistence(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub details: String,
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::ValidationFailed(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        AppError::Forbidden(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Upstream(_)
            | AppError::Configuration(_)
            | AppError::Persistence(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn summary(&self) -> String {
        match self {
            AppError::Upstream(_) => "Upstream provider error".to_string(),
            AppError::Configuration(_) => "Invalid provider configuration".to_string(),
            AppError::Persistence(_) => "Failed to save data".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        let details = match self {
            AppError::Upstream(e) => e.to_string(),
            AppError::Persistence(e) | AppError::Internal(e) => format!("{:#}", e),
            other => other.to_string(),
        };
        ErrorBody {
            error: self.summary(),
            details,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AppError::NotFound(err.to_string()),
            StoreError::Forbidden => AppError::Forbidden(err.to_string()),
            StoreError::InvalidArgument(msg) => AppError::ValidationFailed(msg),
            StoreError::Storage(e) => AppError::Persistence(e),
        }
    }
}

impl From<RouteError> for AppError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::UnknownModel(_) => AppError::validation("Invalid model selected"),
            RouteError::ProviderNotConfigured(_) => AppError::Configuration(err.to_string()),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::ValidationFailed(err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::UnknownTicket | UploadError::Expired => AppError::NotFound(err.to_string()),
            UploadError::Storage(e) => AppError::Persistence(e),
            other => AppError::ValidationFailed(other.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(_: AuthError) -> Self {
        AppError::Unauthenticated
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::forbidden("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::Configuration("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Upstream(ProviderError::AuthError("bad key".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_store_errors_map_to_statuses() {
        assert_eq!(AppError::from(StoreError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::from(StoreError::Forbidden).status(), StatusCode::FORBIDDEN);
        let err = AppError::from(StoreError::InvalidArgument("empty".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_route_errors() {
        let err = AppError::from(RouteError::UnknownModel("gpt-9".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.body().error, "Invalid model selected");

        let err = AppError::from(RouteError::ProviderNotConfigured(crate::models::ProviderId::Google));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body().error, "Invalid provider configuration");
    }

    #[test]
    fn test_body_carries_details() {
        let body = AppError::Upstream(ProviderError::AuthError("Invalid API key".into())).body();
        assert_eq!(body.error, "Upstream provider error");
        assert!(body.details.contains("Invalid API key"));

        let body = AppError::validation("Too many images").body();
        assert_eq!(body.error, "Too many images");
        assert_eq!(body.details, "Too many images");
    }
}
