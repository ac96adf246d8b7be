use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

/// Structured error body, matching the Django REST Framework shape clients already parse.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub detail: String,
    pub attr: Option<String>,
}

/// Why a single send to a single subscriber connection failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection is closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to serialize event: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("delivery to connection {connection_id} failed: {source}")]
    DeliveryFailure {
        connection_id: String,
        #[source]
        source: DeliveryError,
    },
    #[error("audit write failed: {0}")]
    AuditWriteFailure(String),
    #[error("Database error: {0}")]
    DatabaseError(sqlx::Error, Option<String>),
    #[error("database unavailable")]
    DatabaseUnavailable,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlagError {
    pub fn flag_not_found(id: impl ToString) -> Self {
        FlagError::NotFound {
            entity: "flag",
            id: id.to_string(),
        }
    }

    pub fn override_not_found(flag_id: impl ToString, user_id: impl ToString) -> Self {
        FlagError::NotFound {
            entity: "override",
            id: format!("{}/{}", flag_id.to_string(), user_id.to_string()),
        }
    }

    pub fn connection_not_found(connection_id: &str) -> Self {
        FlagError::NotFound {
            entity: "connection",
            id: connection_id.to_string(),
        }
    }

    /// Classifies a sqlx failure. Unique violations become `Conflict` so that races the
    /// pre-insert lookup can't see still surface as the right error kind.
    pub fn from_sqlx(error: sqlx::Error, context: &str) -> Self {
        if let Some(db_error) = error.as_database_error() {
            if db_error.code().as_deref() == Some("23505") {
                return FlagError::Conflict(context.to_string());
            }
        }
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                tracing::error!("Database unavailable during {}: {}", context, error);
                FlagError::DatabaseUnavailable
            }
            other => FlagError::DatabaseError(other, Some(context.to_string())),
        }
    }

    /// Returns (error_code, status_code) for this error.
    fn error_metadata(&self) -> (&'static str, StatusCode) {
        match self {
            FlagError::NotFound { .. } => ("not_found", StatusCode::NOT_FOUND),
            FlagError::Conflict(_) => ("conflict", StatusCode::CONFLICT),
            FlagError::ValidationFailed(_) => ("validation_failed", StatusCode::BAD_REQUEST),
            FlagError::DeliveryFailure { .. } => {
                ("delivery_failure", StatusCode::INTERNAL_SERVER_ERROR)
            }
            FlagError::AuditWriteFailure(_) => {
                ("audit_write_failure", StatusCode::INTERNAL_SERVER_ERROR)
            }
            FlagError::DatabaseError(_, _) => ("database_error", StatusCode::INTERNAL_SERVER_ERROR),
            FlagError::DatabaseUnavailable => {
                ("database_unavailable", StatusCode::SERVICE_UNAVAILABLE)
            }
            FlagError::Internal(_) => ("internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Returns a short error code for logging and response bodies.
    pub fn error_code(&self) -> &'static str {
        self.error_metadata().0
    }

    pub fn status_code(&self) -> StatusCode {
        self.error_metadata().1
    }

    pub fn is_5xx(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = match &self {
            FlagError::NotFound { .. }
            | FlagError::Conflict(_)
            | FlagError::ValidationFailed(_) => self.to_string(),
            FlagError::DatabaseError(sqlx_error, context) => {
                if let Some(ctx) = context {
                    tracing::error!("Database error with context '{}': {}", ctx, sqlx_error);
                } else {
                    tracing::error!("Database error: {}", sqlx_error);
                }
                "A database error occurred. Please try again later.".to_string()
            }
            FlagError::DatabaseUnavailable => {
                "Our database service is currently unavailable. Please try again later."
                    .to_string()
            }
            other => {
                tracing::error!("Internal server error: {}", other);
                "An internal server error occurred. Please try again later.".to_string()
            }
        };

        let error_type = if status.is_client_error() {
            "invalid_request"
        } else {
            "server_error"
        };

        let body = ErrorResponse {
            error_type: error_type.to_string(),
            code: self.error_code().to_string(),
            detail,
            attr: None,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;

    #[test]
    fn test_error_metadata_maps_taxonomy_to_status() {
        assert_eq!(
            FlagError::flag_not_found("abc").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            FlagError::Conflict("dup".to_string()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            FlagError::ValidationFailed("empty key".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            FlagError::DatabaseUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert!(FlagError::AuditWriteFailure("boom".to_string()).is_5xx());
        assert!(!FlagError::ValidationFailed("x".to_string()).is_5xx());
    }

    #[test]
    fn test_not_found_message_carries_identifier() {
        let err = FlagError::override_not_found("flag-1", "user-2");
        assert_eq!(err.to_string(), "override flag-1/user-2 not found");
        assert_eq!(err.error_code(), "not_found");
    }

    #[test]
    fn test_delivery_failure_keeps_source() {
        let err = FlagError::DeliveryFailure {
            connection_id: "c1".to_string(),
            source: DeliveryError::Closed,
        };
        assert_eq!(
            err.to_string(),
            "delivery to connection c1 failed: connection is closed"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_into_response_renders_json_body() {
        let response = FlagError::Conflict("flag key beta already exists".to_string())
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "conflict");
        assert_eq!(json["type"], "invalid_request");
        assert_eq!(
            json["detail"],
            "conflict: flag key beta already exists"
        );
    }
}
