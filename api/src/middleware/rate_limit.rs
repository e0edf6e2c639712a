use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode};
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
};

type RateLimitLayer = GovernorLayer<SmartIpKeyExtractor, governor::middleware::NoOpMiddleware, Body>;

/// Rate limit for POST /v1/billing/webhook: 120 requests/minute per IP.
///
/// Providers redeliver in bursts after an outage, hence the large burst.
pub fn webhook_layer() -> RateLimitLayer {
    per_ip_layer("webhook", Duration::from_millis(500), 60)
}

/// Rate limit for POST /v1/chat and /v1/chat/advanced: 30 requests/minute per IP.
pub fn chat_layer() -> RateLimitLayer {
    per_ip_layer("chat", Duration::from_secs(2), 10)
}

/// Rate limit for GET /v1/entitlement: 120 requests/minute per IP.
pub fn entitlement_layer() -> RateLimitLayer {
    per_ip_layer("entitlement", Duration::from_millis(500), 30)
}

fn per_ip_layer(name: &str, replenish_every: Duration, burst: u32) -> RateLimitLayer {
    let config = GovernorConfigBuilder::default()
        .period(replenish_every)
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .unwrap_or_else(|| panic!("invalid governor config for {name}"));
    GovernorLayer::new(config).error_handler(json_error_handler)
}

/// Returns JSON in ApiError format with a Retry-After header.
fn json_error_handler(err: GovernorError) -> Response<Body> {
    let (status, retry_after, message) = match err {
        GovernorError::TooManyRequests { wait_time, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            Some(wait_time),
            format!("Too many requests. Retry after {wait_time} seconds."),
        ),
        GovernorError::UnableToExtractKey => (
            StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "Unable to determine client identity for rate limiting".to_string(),
        ),
        GovernorError::Other { code, msg, .. } => (code, None, msg.unwrap_or_default()),
    };

    let body = serde_json::json!({
        "error": mindease_core::error::codes::RATE_LIMITED,
        "message": message,
        "request_id": uuid::Uuid::now_v7().to_string(),
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Some(wait_time) = retry_after {
        headers.insert("retry-after", HeaderValue::from(wait_time));
    }
    response
}
