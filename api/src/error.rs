use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mindease_core::error::{self, ApiError};

use crate::ledger::LedgerError;
use crate::orchestrator::ChatError;
use crate::premium::GuardError;
use crate::selector::SelectionError;

/// Failure of a persistence collaborator (ledger, subscription status, crisis sink).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or invalid identity (401). Never downgraded to anonymous access.
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Authenticated but not entitled to a premium-only operation (403)
    PremiumRequired,
    /// Every chat backend is unhealthy (503)
    NoBackendAvailable,
    /// Chat backend timed out after its retry (504)
    BackendTimeout { backend: String },
    /// Chat backend failed after its retry (502)
    BackendFailed { backend: String, message: String },
    /// Webhook id reused with a different payload (409)
    WebhookConflict { event_id: String },
    /// Webhook signature missing or invalid (400)
    WebhookSignature { message: String },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

fn api_error(code: &str, message: String, request_id: String) -> ApiError {
    ApiError {
        error: code.to_string(),
        error_code: None,
        message,
        field: None,
        received: None,
        request_id,
        docs_hint: None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    field,
                    received,
                    docs_hint,
                    ..api_error(error::codes::VALIDATION_FAILED, message, request_id)
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    docs_hint,
                    ..api_error(error::codes::UNAUTHORIZED, message, request_id)
                },
            ),
            AppError::PremiumRequired => (
                StatusCode::FORBIDDEN,
                ApiError {
                    docs_hint: Some(
                        "This operation requires an active premium subscription.".to_string(),
                    ),
                    ..api_error(
                        error::codes::PREMIUM_REQUIRED,
                        "Premium subscription required".to_string(),
                        request_id,
                    )
                },
            ),
            AppError::NoBackendAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                api_error(
                    error::codes::NO_BACKEND_AVAILABLE,
                    "No chat backend is currently available. Please retry shortly.".to_string(),
                    request_id,
                ),
            ),
            AppError::BackendTimeout { backend } => (
                StatusCode::GATEWAY_TIMEOUT,
                ApiError {
                    error_code: Some(backend.clone()),
                    ..api_error(
                        error::codes::BACKEND_TIMEOUT,
                        format!("Chat backend '{backend}' did not respond in time"),
                        request_id,
                    )
                },
            ),
            AppError::BackendFailed { backend, message } => {
                tracing::warn!(backend = %backend, error = %message, "chat backend failure surfaced to caller");
                (
                    StatusCode::BAD_GATEWAY,
                    ApiError {
                        error_code: Some(backend.clone()),
                        ..api_error(
                            error::codes::BACKEND_ERROR,
                            format!("Chat backend '{backend}' failed"),
                            request_id,
                        )
                    },
                )
            }
            AppError::WebhookConflict { event_id } => (
                StatusCode::CONFLICT,
                ApiError {
                    field: Some("id".to_string()),
                    received: Some(serde_json::Value::String(event_id)),
                    docs_hint: Some(
                        "Event ids are idempotency keys. A redelivery must carry the same payload."
                            .to_string(),
                    ),
                    ..api_error(
                        error::codes::WEBHOOK_CONFLICT,
                        "Event id was already used with a different payload".to_string(),
                        request_id,
                    )
                },
            ),
            AppError::WebhookSignature { message } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    field: Some("headers.billing-signature".to_string()),
                    ..api_error(error::codes::WEBHOOK_SIGNATURE_INVALID, message, request_id)
                },
            ),
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    api_error(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred".to_string(),
                        request_id,
                    ),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    api_error(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred".to_string(),
                        request_id,
                    ),
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(err) => AppError::Database(err),
            StoreError::Unavailable(msg) => AppError::Internal(msg),
        }
    }
}

impl From<GuardError> for AppError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Unauthenticated => AppError::Unauthorized {
                message: "Authentication required".to_string(),
                docs_hint: Some("Include 'Authorization: Bearer <token>' header.".to_string()),
            },
            GuardError::PremiumRequired => AppError::PremiumRequired,
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Store(err) => err.into(),
            // 500 tells the provider to redeliver; the record stays retryable.
            err @ LedgerError::Processing { .. } => AppError::Internal(err.to_string()),
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::EmptyMessage => AppError::Validation {
                message: "message must not be empty".to_string(),
                field: Some("message".to_string()),
                received: None,
                docs_hint: None,
            },
            ChatError::Selection(SelectionError::NoBackendAvailable) => {
                AppError::NoBackendAvailable
            }
            ChatError::Backend { backend, source } if source.is_timeout() => {
                AppError::BackendTimeout { backend }
            }
            ChatError::Backend { backend, source } => AppError::BackendFailed {
                backend,
                message: source.to_string(),
            },
        }
    }
}
