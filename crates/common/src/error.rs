use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::lifecycle::TransitionError;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Redis(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Transition(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

/// Dispatch-time failure taxonomy.
///
/// These are recorded on the delivery attempt row (as [`DeliveryError::code`]
/// plus the display message), never thrown back to the original caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("malformed request: {0}")]
    Validation(String),

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("permanent recipient error: {0}")]
    PermanentRecipient(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("provider not configured: {0}")]
    Configuration(String),

    #[error("deadline exceeded after {0}")]
    Timeout(String),
}

impl DeliveryError {
    /// Stable machine-readable code stored in `delivery_attempts.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Validation(_) => "VALIDATION_ERROR",
            DeliveryError::TransientProvider(_) => "TRANSIENT_PROVIDER_ERROR",
            DeliveryError::PermanentRecipient(_) => "PERMANENT_RECIPIENT_ERROR",
            DeliveryError::CircuitOpen(_) => "CIRCUIT_OPEN",
            DeliveryError::Configuration(_) => "CONFIGURATION_ERROR",
            DeliveryError::Timeout(_) => "TIMEOUT",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::TransientProvider(_))
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Validation(msg) => AppError::Validation(msg),
            DeliveryError::Configuration(msg) => AppError::Config(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_codes() {
        assert_eq!(
            DeliveryError::CircuitOpen("twilio/sms".into()).code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(DeliveryError::Timeout("120s".into()).code(), "TIMEOUT");
        assert!(DeliveryError::TransientProvider("503".into()).is_retryable());
        assert!(!DeliveryError::PermanentRecipient("gone".into()).is_retryable());
    }

    #[test]
    fn test_validation_maps_to_bad_request() {
        let response = AppError::Validation("title is required".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
