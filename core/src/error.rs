use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response returned by every endpoint.
/// Clients branch on `error`/`error_code`; `message` is for humans.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "premium_required")
    pub error: String,
    /// Domain-specific machine code for deterministic remediation (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const PREMIUM_REQUIRED: &str = "premium_required";
    pub const NO_BACKEND_AVAILABLE: &str = "no_backend_available";
    pub const BACKEND_TIMEOUT: &str = "backend_timeout";
    pub const BACKEND_ERROR: &str = "backend_error";
    pub const WEBHOOK_CONFLICT: &str = "webhook_conflict";
    pub const WEBHOOK_REJECTED: &str = "webhook_rejected";
    pub const WEBHOOK_SIGNATURE_INVALID: &str = "webhook_signature_invalid";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const RATE_LIMITED: &str = "rate_limited";
}
